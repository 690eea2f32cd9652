//! Statement templates and `{{key}}` expansion.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// SQL templates for one call. An empty template means "use the backend default".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statements {
    #[serde(default)]
    pub creation: String,
    #[serde(default)]
    pub revocation: String,
    #[serde(default)]
    pub rollback: String,
    #[serde(default)]
    pub renew: String,
}

impl Statements {
    pub fn with_creation<S: Into<String>>(mut self, creation: S) -> Self {
        self.creation = creation.into();
        self
    }

    pub fn with_revocation<S: Into<String>>(mut self, revocation: S) -> Self {
        self.revocation = revocation.into();
        self
    }

    pub fn with_rollback<S: Into<String>>(mut self, rollback: S) -> Self {
        self.rollback = rollback.into();
        self
    }

    pub fn with_renew<S: Into<String>>(mut self, renew: S) -> Self {
        self.renew = renew.into();
        self
    }
}

/// Return `custom` unless it is blank, else `default`.
pub fn or_default<'a>(custom: &'a str, default: &'a str) -> &'a str {
    if custom.trim().is_empty() {
        default
    } else {
        custom
    }
}

/// Replace every `{{key}}` in `template` with its value.
///
/// Single left-to-right pass: substituted values are never scanned again.
/// Placeholders with no matching key, and an unterminated `{{`, are copied
/// through unchanged.
pub fn expand(template: &str, values: &HashMap<&str, &str>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];

        let Some(end) = after_open.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };

        let key = &after_open[..end];
        if let Some(inner) = key.find("{{") {
            // The outer `{{` is literal text; resume at the inner one.
            out.push_str(&rest[start..start + 2 + inner]);
            rest = &after_open[inner..];
            continue;
        }

        match values.get(key) {
            Some(value) => out.push_str(value),
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    out
}

/// Split a `;`-separated template into trimmed, non-empty statements.
pub fn split_statements(template: &str) -> Vec<&str> {
    template
        .split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .collect()
}

/// Split `template` into statements, then expand each one.
pub fn render(template: &str, values: &HashMap<&str, &str>) -> Vec<String> {
    split_statements(template)
        .into_iter()
        .map(|statement| expand(statement, values))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("name", "v-app-role-abc"),
            ("password", "A1a-secret"),
            ("expiration", "2030-01-01 00:00:00+0000"),
        ])
    }

    #[test]
    fn test_expand_replaces_known_keys() {
        let sql = expand(
            "CREATE ROLE \"{{name}}\" WITH PASSWORD '{{password}}' VALID UNTIL '{{expiration}}'",
            &values(),
        );
        assert_eq!(
            sql,
            "CREATE ROLE \"v-app-role-abc\" WITH PASSWORD 'A1a-secret' VALID UNTIL '2030-01-01 00:00:00+0000'"
        );
    }

    #[test]
    fn test_expand_leaves_unknown_placeholders() {
        assert_eq!(
            expand("GRANT {{privileges}} TO \"{{name}}\"", &values()),
            "GRANT {{privileges}} TO \"v-app-role-abc\""
        );
        assert_eq!(expand("{{}}", &values()), "{{}}");
    }

    #[test]
    fn test_expand_does_not_reexpand_values() {
        let values = HashMap::from([("name", "{{password}}"), ("password", "leak")]);
        assert_eq!(expand("{{name}}", &values), "{{password}}");
    }

    #[test]
    fn test_expand_malformed_braces() {
        assert_eq!(expand("DROP ROLE {{name", &values()), "DROP ROLE {{name");
        assert_eq!(expand("x {{a {{name}}", &values()), "x {{a v-app-role-abc");
        assert_eq!(expand("}} {{name}} }}", &values()), "}} v-app-role-abc }}");
    }

    #[test]
    fn test_split_statements_drops_empty_fragments() {
        assert_eq!(
            split_statements(" REVOKE ALL ON x FROM y ;;\n DROP ROLE y; "),
            vec!["REVOKE ALL ON x FROM y", "DROP ROLE y"]
        );
        assert!(split_statements(" ; ;").is_empty());
    }

    #[test]
    fn test_render_splits_before_expanding() {
        let values = HashMap::from([("name", "a;b")]);
        assert_eq!(render("DROP ROLE '{{name}}';", &values), vec!["DROP ROLE 'a;b'"]);
    }

    #[test]
    fn test_or_default() {
        assert_eq!(or_default("", "DEFAULT"), "DEFAULT");
        assert_eq!(or_default("  \n", "DEFAULT"), "DEFAULT");
        assert_eq!(or_default("CUSTOM", "DEFAULT"), "CUSTOM");
    }
}
