//! Template placeholder resolution for server commands.
//!
//! Commands are stored unrendered, with `{{variable}}` placeholders that are
//! substituted at start time. Unknown placeholders are left literal so that
//! partial rendering works and missing variables can be reported separately
//! via [`find_missing_variables`].
//!
//! A second form, `{{$ "server" "property"}}`, looks up a field of a sibling
//! server in the same working directory. Unlike plain placeholders this form
//! fails loudly: a missing sibling or property is a user error, not something
//! to render around.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;

use crate::drift::ConfigKey;
use crate::error::{Error, Result};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").expect("valid regex"));

static SIBLING_LOOKUP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\{\{\s*\$\s*"([^"]+)"\s+"([^"]+)"\s*\}\}"#).expect("valid regex")
});

/// Variable values available during rendering.
pub type TemplateVars = BTreeMap<String, String>;

/// Resolver for `{{$ "server" "property"}}`: given the scoping directory, a
/// sibling server name and a property name, returns the property value or a
/// human-readable failure reason.
pub type SiblingResolver<'a> = &'a dyn Fn(&Path, &str, &str) -> std::result::Result<String, String>;

/// Map a built-in template variable to the configuration key that provides it.
///
/// `port` and `url` are derived automatically and map to nothing.
pub fn builtin_config_key(name: &str) -> Option<ConfigKey> {
    match name {
        "hostname" => Some(ConfigKey::Hostname),
        "https-cert" => Some(ConfigKey::HttpsCert),
        "https-key" => Some(ConfigKey::HttpsKey),
        _ => None,
    }
}

/// Whether a variable is auto-derived and can never be set by the user.
pub fn is_auto_variable(name: &str) -> bool {
    matches!(name, "port" | "url")
}

/// Replace every `{{name}}` with the matching variable's value.
///
/// Placeholders without a value are left as-is. Sibling lookups are not
/// touched; use [`render_with_lookup`] when they must resolve.
pub fn render(template: &str, vars: &TemplateVars) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures| {
            let name = &caps[1];
            match vars.get(name) {
                Some(value) => value.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Render a template including `{{$ "server" "property"}}` lookups.
///
/// Lookup failures and a missing scoping directory are surfaced as errors.
pub fn render_with_lookup(
    template: &str,
    vars: &TemplateVars,
    scope_dir: Option<&Path>,
    resolver: SiblingResolver,
) -> Result<String> {
    let mut output = String::with_capacity(template.len());
    let mut last = 0;
    for caps in SIBLING_LOOKUP.captures_iter(template) {
        let whole = caps.get(0).expect("match");
        let server = &caps[1];
        let property = &caps[2];
        let dir = scope_dir.ok_or_else(|| Error::TemplateLookup {
            reason: format!(
                "cannot resolve {{{{$ \"{}\" \"{}\"}}}} without a working directory",
                server, property
            ),
        })?;
        let value = resolver(dir, server, property)
            .map_err(|reason| Error::TemplateLookup { reason })?;
        output.push_str(&template[last..whole.start()]);
        output.push_str(&value);
        last = whole.end();
    }
    output.push_str(&template[last..]);
    Ok(render(&output, vars))
}

/// Every distinct plain placeholder name in the template.
pub fn extract_variable_names(template: &str) -> BTreeSet<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// A referenced variable with no (or an empty) value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingVariable {
    pub name: String,
    /// Configuration key that would provide the value, if any.
    pub config_key: Option<ConfigKey>,
    /// Whether the user can supply the value through configuration.
    pub configurable: bool,
    /// Whether this is a user-defined variable rather than a built-in.
    pub is_custom: bool,
}

/// Report every referenced variable whose value is absent or empty.
pub fn find_missing_variables(template: &str, vars: &TemplateVars) -> Vec<MissingVariable> {
    extract_variable_names(template)
        .into_iter()
        .filter(|name| vars.get(name).is_none_or(|v| v.is_empty()))
        .map(|name| {
            let config_key = builtin_config_key(&name);
            let configurable = config_key.is_some();
            let is_custom = config_key.is_none() && !is_auto_variable(&name);
            MissingVariable {
                name,
                config_key,
                configurable,
                is_custom,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn vars(pairs: &[(&str, &str)]) -> TemplateVars {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn renders_known_placeholders() {
        let out = render(
            "npm start --port {{port}} --host {{hostname}}",
            &vars(&[("port", "4123"), ("hostname", "localhost")]),
        );
        assert_eq!(out, "npm start --port 4123 --host localhost");
    }

    #[test]
    fn unknown_placeholders_stay_literal() {
        let out = render("serve {{port}} {{missing}}", &vars(&[("port", "3000")]));
        assert_eq!(out, "serve 3000 {{missing}}");
    }

    #[test]
    fn extracts_distinct_names() {
        let names = extract_variable_names("{{url}}/{{port}} and {{port}} again");
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["port".to_string(), "url".to_string()]
        );
    }

    #[test]
    fn sibling_lookup_excluded_from_names() {
        let names = extract_variable_names(r#"curl {{$ "api" "url"}}/{{path}}"#);
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec!["path".to_string()]);
    }

    #[test]
    fn sibling_lookup_resolves() {
        let dir = PathBuf::from("/proj");
        let resolver = |scope: &Path, server: &str, property: &str| {
            assert_eq!(scope, Path::new("/proj"));
            assert_eq!(server, "api");
            assert_eq!(property, "port");
            Ok("4500".to_string())
        };
        let out = render_with_lookup(
            r#"wait-on tcp:{{$ "api" "port"}}"#,
            &TemplateVars::new(),
            Some(&dir),
            &resolver,
        )
        .unwrap();
        assert_eq!(out, "wait-on tcp:4500");
    }

    #[test]
    fn sibling_lookup_fails_without_scope() {
        let resolver = |_: &Path, _: &str, _: &str| Ok("x".to_string());
        let err = render_with_lookup(
            r#"{{$ "api" "port"}}"#,
            &TemplateVars::new(),
            None,
            &resolver,
        )
        .unwrap_err();
        assert!(matches!(err, Error::TemplateLookup { .. }));
    }

    #[test]
    fn sibling_lookup_propagates_resolver_failure() {
        let dir = PathBuf::from("/proj");
        let resolver =
            |_: &Path, _: &str, _: &str| Err("no server named 'api' in /proj".to_string());
        let err = render_with_lookup(
            r#"{{$ "api" "port"}}"#,
            &TemplateVars::new(),
            Some(&dir),
            &resolver,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no server named 'api'"));
    }

    #[test]
    fn missing_variables_classified() {
        let missing = find_missing_variables(
            "{{hostname}} {{port}} {{api-url}}",
            &vars(&[("hostname", "")]),
        );
        let by_name: std::collections::BTreeMap<_, _> =
            missing.iter().map(|m| (m.name.as_str(), m)).collect();

        let hostname = by_name["hostname"];
        assert_eq!(hostname.config_key, Some(ConfigKey::Hostname));
        assert!(hostname.configurable);
        assert!(!hostname.is_custom);

        let port = by_name["port"];
        assert_eq!(port.config_key, None);
        assert!(!port.configurable);
        assert!(!port.is_custom);

        let custom = by_name["api-url"];
        assert_eq!(custom.config_key, None);
        assert!(!custom.configurable);
        assert!(custom.is_custom);
    }
}
