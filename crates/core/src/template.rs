//! Schema-driven templater.
//!
//! Every spec type implements [`Template`], which produces a fresh deep copy
//! of the value. Only [`Templated`] leaves are rewritten: their `{{name}}`
//! placeholders are interpolated against the current [`Params`]. Plain
//! `String` fields and all non-string leaves are copied unchanged, so whether
//! a field is templatable is decided by its type at compile time.
//!
//! Structs get an implementation through [`template_struct!`]:
//!
//! ```
//! use conflux_core::{template_struct, Params, Template, Templated};
//!
//! #[derive(Clone, Debug, PartialEq)]
//! struct Spec { url: Templated, retries: u32 }
//! template_struct!(Spec { url, retries });
//!
//! let spec = Spec { url: Templated::from("ipfs://{{id}}"), retries: 2 };
//! let out = spec.template(&Params::new().with("id", "7")).unwrap();
//! assert_eq!(out.url.as_str(), "ipfs://7");
//! assert_eq!(spec.url.as_str(), "ipfs://{{id}}");
//! ```

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use handlebars::Handlebars;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::params::Params;

static ENGINE: Lazy<Handlebars<'static>> = Lazy::new(|| {
    let mut hb = Handlebars::new();
    hb.set_strict_mode(true);
    hb.register_escape_fn(handlebars::no_escape);
    hb
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("malformed template {template:?}: {reason}")]
    Malformed { template: String, reason: String },
    #[error("unresolved placeholder in {template:?}: {reason}")]
    Unresolved { template: String, reason: String },
}

/// Interpolate `{{name}}` placeholders in `raw` against `params`.
/// Unknown placeholders fail; strings without `{{` are returned as-is.
pub fn interpolate(raw: &str, params: &Params) -> Result<String, TemplateError> {
    if !raw.contains("{{") {
        return Ok(raw.to_string());
    }
    handlebars::Template::compile(raw)
        .map_err(|e| TemplateError::Malformed { template: raw.to_string(), reason: e.to_string() })?;
    ENGINE
        .render_template(raw, params.as_map())
        .map_err(|e| TemplateError::Unresolved { template: raw.to_string(), reason: e.to_string() })
}

/// Deep copy with placeholder interpolation on templatable leaves.
/// Never mutates `self`.
pub trait Template: Sized {
    fn template(&self, params: &Params) -> Result<Self, TemplateError>;
}

/// A string field whose placeholders are interpolated when templated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Templated(String);

impl Templated {
    pub fn new(raw: impl Into<String>) -> Self { Self(raw.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn into_string(self) -> String { self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl From<&str> for Templated {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for Templated {
    fn from(s: String) -> Self { Self(s) }
}

impl std::fmt::Display for Templated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

impl Template for Templated {
    fn template(&self, params: &Params) -> Result<Self, TemplateError> {
        interpolate(&self.0, params).map(Templated)
    }
}

macro_rules! copy_leaf {
    ($($t:ty),* $(,)?) => {
        $(impl Template for $t {
            fn template(&self, _params: &Params) -> Result<Self, TemplateError> { Ok(self.clone()) }
        })*
    };
}

copy_leaf!(String, bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, serde_json::Value, std::time::Duration);

impl<T: Template> Template for Option<T> {
    fn template(&self, params: &Params) -> Result<Self, TemplateError> {
        self.as_ref().map(|v| v.template(params)).transpose()
    }
}

impl<T: Template> Template for Box<T> {
    fn template(&self, params: &Params) -> Result<Self, TemplateError> {
        Ok(Box::new(self.as_ref().template(params)?))
    }
}

impl<T: Template> Template for Vec<T> {
    fn template(&self, params: &Params) -> Result<Self, TemplateError> {
        self.iter().map(|v| v.template(params)).collect()
    }
}

impl<K: Clone + Ord, V: Template> Template for BTreeMap<K, V> {
    fn template(&self, params: &Params) -> Result<Self, TemplateError> {
        self.iter().map(|(k, v)| Ok((k.clone(), v.template(params)?))).collect()
    }
}

impl<K: Clone + Eq + Hash, V: Template, S: std::hash::BuildHasher + Default> Template for HashMap<K, V, S> {
    fn template(&self, params: &Params) -> Result<Self, TemplateError> {
        self.iter().map(|(k, v)| Ok((k.clone(), v.template(params)?))).collect()
    }
}

/// Implement [`Template`] for a struct by templating every listed field.
/// All fields must be listed; a missing one is a compile error.
#[macro_export]
macro_rules! template_struct {
    ($ty:ident { $($field:ident),* $(,)? }) => {
        impl $crate::Template for $ty {
            fn template(&self, params: &$crate::Params) -> ::std::result::Result<Self, $crate::TemplateError> {
                Ok(Self { $($field: $crate::Template::template(&self.$field, params)?),* })
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq)]
    struct Arg { kind: Templated, value: Templated, note: String }
    template_struct!(Arg { kind, value, note });

    #[derive(Debug, Clone, PartialEq)]
    enum Source { Url(Templated), Inline(serde_json::Value) }

    impl Template for Source {
        fn template(&self, params: &Params) -> Result<Self, TemplateError> {
            Ok(match self {
                Source::Url(u) => Source::Url(u.template(params)?),
                Source::Inline(v) => Source::Inline(v.clone()),
            })
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Spec {
        address: Templated,
        chain: u64,
        args: Vec<Arg>,
        source: Option<Box<Source>>,
        labels: BTreeMap<String, Templated>,
    }
    template_struct!(Spec { address, chain, args, source, labels });

    fn spec() -> Spec {
        let mut labels = BTreeMap::new();
        labels.insert("owner".to_string(), Templated::from("{{contract}}"));
        Spec {
            address: "{{contract}}".into(),
            chain: 80001,
            args: vec![Arg { kind: "uint256".into(), value: "{{id}}".into(), note: "{{id}} stays".into() }],
            source: Some(Box::new(Source::Url("ipfs://base/{{id}}.json".into()))),
            labels,
        }
    }

    #[test]
    fn rewrites_only_templated_leaves() {
        let params = Params::new().with("id", "7").with("contract", "0xabc");
        let out = spec().template(&params).expect("template");
        assert_eq!(out.address.as_str(), "0xabc");
        assert_eq!(out.args[0].value.as_str(), "7");
        assert_eq!(out.args[0].note, "{{id}} stays");
        assert_eq!(out.source, Some(Box::new(Source::Url("ipfs://base/7.json".into()))));
        assert_eq!(out.labels["owner"].as_str(), "0xabc");
        assert_eq!(out.chain, 80001);
    }

    #[test]
    fn original_is_untouched() {
        let original = spec();
        let snapshot = original.clone();
        let _ = original.template(&Params::new().with("id", "1").with("contract", "c")).expect("template");
        assert_eq!(original, snapshot);
    }

    #[test]
    fn idempotent_without_placeholders() {
        let plain = Spec {
            address: "0xdef".into(),
            chain: 1,
            args: vec![],
            source: Some(Box::new(Source::Inline(json!({"a": "{{not templated}}"})))),
            labels: BTreeMap::new(),
        };
        let empty = Params::new();
        let once = plain.template(&empty).expect("once");
        let twice = once.template(&empty).expect("twice");
        assert_eq!(once, twice);
        assert_eq!(once, plain);
    }

    #[test]
    fn unknown_placeholder_fails() {
        let err = Templated::from("{{missing}}").template(&Params::new()).expect_err("strict");
        assert!(matches!(err, TemplateError::Unresolved { .. }));
    }

    #[test]
    fn malformed_template_fails() {
        let err = Templated::from("{{#if}}").template(&Params::new()).expect_err("malformed");
        assert!(matches!(err, TemplateError::Malformed { .. }));
    }

    #[test]
    fn numbers_and_nested_params_render() {
        let params = Params::new().with("id", 42).with("result", json!({"name": "bob"}));
        assert_eq!(interpolate("{{id}}-{{result.name}}", &params).expect("ok"), "42-bob");
    }
}
