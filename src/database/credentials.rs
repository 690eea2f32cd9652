//! Username, password and expiration synthesis.
//!
//! Every backend, builtin or plugin, produces identifiers through a
//! [`CredentialPolicy`]. Generated usernames always fit the family's identifier
//! limit and always end with the full random suffix.

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;

use super::UsernameConfig;
use crate::secrets::SecretString;

/// Fixed head of generated SQL passwords, guaranteeing mixed character classes.
pub const PASSWORD_PREFIX: &str = "A1a-";

/// Number of random characters following [`PASSWORD_PREFIX`].
pub const PASSWORD_RANDOM_LEN: usize = 20;

/// Timestamp format used in `{{expiration}}`.
pub const EXPIRATION_FORMAT: &str = "%Y-%m-%d %H:%M:%S%z";

/// Produces credentials for one backend family.
pub trait CredentialsProducer: Send + Sync {
    fn generate_username(&self, config: &UsernameConfig) -> String;

    fn generate_password(&self) -> SecretString;

    fn generate_expiration(&self, expiration: DateTime<Utc>) -> String;
}

/// Layout and limits of generated usernames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsernamePolicy {
    pub prefix: &'static str,
    pub separator: char,
    pub display_len: usize,
    pub role_len: usize,
    pub max_len: usize,
    pub suffix_len: usize,
    pub lowercase: bool,
}

impl UsernamePolicy {
    /// Build `prefix-display-role-suffix` using `rng` for the suffix.
    ///
    /// Segments are sanitized, cut to their own limits, and then, if the whole
    /// would exceed `max_len`, the role segment shrinks first and the display
    /// segment second. Empty segments are omitted with their separator.
    pub fn generate<R: Rng + ?Sized>(&self, config: &UsernameConfig, rng: &mut R) -> String {
        let mut display = self.sanitize(&config.display_name, self.display_len);
        let mut role = self.sanitize(&config.role_name, self.role_len);

        let budget = self
            .max_len
            .saturating_sub(self.prefix.len() + 1 + self.suffix_len);
        let cost = |segment: &str| if segment.is_empty() { 0 } else { segment.len() + 1 };

        if cost(&display) + cost(&role) > budget {
            let room = budget.saturating_sub(cost(&display));
            role.truncate(room.saturating_sub(1));
        }
        if cost(&display) + cost(&role) > budget {
            display.truncate(budget.saturating_sub(1));
        }

        let mut username = String::with_capacity(self.max_len);
        username.push_str(self.prefix);
        for segment in [&display, &role] {
            if !segment.is_empty() {
                username.push(self.separator);
                username.push_str(segment);
            }
        }
        username.push(self.separator);
        username.push_str(&self.suffix(rng));

        if self.lowercase {
            username.make_ascii_lowercase();
        }
        username
    }

    fn sanitize(&self, raw: &str, limit: usize) -> String {
        raw.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == self.separator {
                    c
                } else {
                    '_'
                }
            })
            .take(limit)
            .collect()
    }

    fn suffix<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        rng.sample_iter(&Alphanumeric)
            .take(self.suffix_len)
            .map(char::from)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordStyle {
    /// [`PASSWORD_PREFIX`] plus random alphanumerics
    Prefixed,
    /// Hyphenated v4 UUID
    Uuid,
}

/// Credentials policy of a backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialPolicy {
    pub username: UsernamePolicy,
    pub password: PasswordStyle,
}

impl CredentialPolicy {
    pub const fn postgres() -> Self {
        Self {
            username: UsernamePolicy {
                prefix: "v",
                separator: '-',
                display_len: 23,
                role_len: 23,
                max_len: 63,
                suffix_len: 20,
                lowercase: false,
            },
            password: PasswordStyle::Prefixed,
        }
    }

    pub const fn mysql() -> Self {
        Self {
            username: UsernamePolicy {
                prefix: "v",
                separator: '-',
                display_len: 4,
                role_len: 4,
                max_len: 16,
                suffix_len: 8,
                lowercase: false,
            },
            password: PasswordStyle::Prefixed,
        }
    }

    pub const fn cassandra() -> Self {
        Self {
            username: UsernamePolicy {
                prefix: "vault",
                separator: '_',
                display_len: 15,
                role_len: 15,
                max_len: 100,
                suffix_len: 20,
                lowercase: true,
            },
            password: PasswordStyle::Uuid,
        }
    }

    /// Policy registered for `family`, if it is one of the known families.
    pub fn for_family(family: &str) -> Option<Self> {
        match family {
            "postgres" => Some(Self::postgres()),
            "mysql" => Some(Self::mysql()),
            "cassandra" => Some(Self::cassandra()),
            _ => None,
        }
    }

    pub fn generate_username_with<R: Rng + ?Sized>(
        &self,
        config: &UsernameConfig,
        rng: &mut R,
    ) -> String {
        self.username.generate(config, rng)
    }

    pub fn generate_password_with<R: Rng + ?Sized>(&self, rng: &mut R) -> SecretString {
        match self.password {
            PasswordStyle::Prefixed => {
                let mut password = String::with_capacity(PASSWORD_PREFIX.len() + PASSWORD_RANDOM_LEN);
                password.push_str(PASSWORD_PREFIX);
                password.extend(
                    rng.sample_iter(&Alphanumeric)
                        .take(PASSWORD_RANDOM_LEN)
                        .map(char::from),
                );
                SecretString::new(password)
            }
            PasswordStyle::Uuid => {
                let bytes: [u8; 16] = rng.gen();
                let uuid = uuid::Builder::from_random_bytes(bytes).into_uuid();
                SecretString::new(uuid.hyphenated().to_string())
            }
        }
    }
}

impl CredentialsProducer for CredentialPolicy {
    fn generate_username(&self, config: &UsernameConfig) -> String {
        self.generate_username_with(config, &mut rand::thread_rng())
    }

    fn generate_password(&self) -> SecretString {
        self.generate_password_with(&mut rand::thread_rng())
    }

    fn generate_expiration(&self, expiration: DateTime<Utc>) -> String {
        expiration.format(EXPIRATION_FORMAT).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config(display: &str, role: &str) -> UsernameConfig {
        UsernameConfig::new(display, role)
    }

    fn stem(username: &str, policy: &UsernamePolicy) -> String {
        username[..username.len() - policy.suffix_len].to_string()
    }

    #[test]
    fn test_postgres_username_layout() {
        let policy = CredentialPolicy::postgres();
        let mut rng = StdRng::seed_from_u64(7);
        let username = policy.generate_username_with(&config("token", "readonly"), &mut rng);

        assert!(username.starts_with("v-token-readonly-"));
        assert_eq!(username.len(), "v-token-readonly-".len() + 20);
        assert!(username.len() <= 63);
    }

    #[test]
    fn test_role_segment_shrinks_before_display() {
        let policy = CredentialPolicy::postgres();
        let mut rng = StdRng::seed_from_u64(1);
        let display = "d".repeat(40);
        let role = "r".repeat(40);
        let username = policy.generate_username_with(&config(&display, &role), &mut rng);

        // 63 - "v" - 2 separators around the suffix - 20 leaves 41 for "-display-role".
        assert_eq!(username.len(), 63);
        assert!(username.starts_with(&format!("v-{}-{}-", "d".repeat(23), "r".repeat(16))));
    }

    #[test]
    fn test_mysql_drops_role_to_keep_suffix() {
        let policy = CredentialPolicy::mysql();
        let mut rng = StdRng::seed_from_u64(3);
        let username = policy.generate_username_with(&config("token", "admin"), &mut rng);

        assert!(username.len() <= 16);
        assert!(username.starts_with("v-toke-"));
        assert_eq!(username.len(), "v-toke-".len() + 8);
    }

    #[test]
    fn test_cassandra_username_is_lowercase_with_underscores() {
        let policy = CredentialPolicy::cassandra();
        let mut rng = StdRng::seed_from_u64(11);
        let username = policy.generate_username_with(&config("Token-X", "Ops.Role"), &mut rng);

        assert!(username.starts_with("vault_token_x_ops_role_"));
        assert!(username.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
        assert!(username.len() <= 100);
    }

    #[test]
    fn test_unsafe_characters_are_replaced() {
        let policy = CredentialPolicy::postgres();
        let mut rng = StdRng::seed_from_u64(5);
        let username = policy.generate_username_with(&config("o'brien\"; DROP", "é"), &mut rng);
        assert!(username.starts_with("v-o_brien___DROP-_-"));
    }

    #[test]
    fn test_empty_role_omits_segment() {
        let policy = CredentialPolicy::postgres();
        let mut rng = StdRng::seed_from_u64(9);
        let username = policy.generate_username_with(&config("app", ""), &mut rng);
        assert!(username.starts_with("v-app-"));
        assert_eq!(username.len(), "v-app-".len() + 20);
    }

    #[test]
    fn test_injected_rng_is_deterministic() {
        let policy = CredentialPolicy::postgres();
        let a = policy.generate_username_with(&config("app", "ro"), &mut StdRng::seed_from_u64(42));
        let b = policy.generate_username_with(&config("app", "ro"), &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_password_styles() {
        let password = CredentialPolicy::postgres().generate_password();
        assert!(password.expose_secret().starts_with(PASSWORD_PREFIX));
        assert_eq!(password.len(), PASSWORD_PREFIX.len() + PASSWORD_RANDOM_LEN);
        assert!(password.expose_secret()[4..].chars().all(|c| c.is_ascii_alphanumeric()));

        let password = CredentialPolicy::cassandra().generate_password();
        assert!(uuid::Uuid::parse_str(password.expose_secret()).is_ok());
        assert_ne!(password, CredentialPolicy::cassandra().generate_password());
    }

    #[test]
    fn test_expiration_format() {
        let at = Utc.with_ymd_and_hms(2031, 4, 5, 6, 7, 8).unwrap();
        assert_eq!(
            CredentialPolicy::postgres().generate_expiration(at),
            "2031-04-05 06:07:08+0000"
        );
    }

    #[test]
    fn test_family_lookup() {
        assert_eq!(CredentialPolicy::for_family("mysql"), Some(CredentialPolicy::mysql()));
        assert_eq!(CredentialPolicy::for_family("oracle"), None);
    }

    proptest! {
        #[test]
        fn prop_usernames_fit_family_limit(
            display in ".{0,80}",
            role in ".{0,80}",
            family in prop::sample::select(vec!["postgres", "mysql", "cassandra"]),
            seed in any::<u64>(),
        ) {
            let policy = CredentialPolicy::for_family(family).unwrap();
            let mut rng = StdRng::seed_from_u64(seed);
            let username = policy.generate_username_with(&config(&display, &role), &mut rng);

            prop_assert!(username.len() <= policy.username.max_len);
            prop_assert!(username.is_ascii());
            let suffix = &username[username.len() - policy.username.suffix_len..];
            prop_assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
        }

        #[test]
        fn prop_distinct_display_names_differ_outside_suffix(
            a in "[a-z0-9]{1,23}",
            b in "[a-z0-9]{1,23}",
            role in "[a-z]{0,30}",
        ) {
            prop_assume!(a != b);
            let policy = CredentialPolicy::postgres();
            let mut rng = StdRng::seed_from_u64(0);
            let first = policy.generate_username_with(&config(&a, &role), &mut rng);
            let second = policy.generate_username_with(&config(&b, &role), &mut rng);

            prop_assert_ne!(stem(&first, &policy.username), stem(&second, &policy.username));
        }
    }
}
