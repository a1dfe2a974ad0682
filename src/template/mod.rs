// SPDX-License-Identifier: MIT
//! The command expander — substitutes `{{ .Field }}` tokens in a manifest's
//! configure/compile/install commands against a merged context of host
//! configuration and per-package values.
//!
//! No published templating crate speaks this exact leading-dot field-access
//! grammar for a handful of fixed field names, so substitution is done with
//! a single `once_cell::Lazy<Regex>` scanning the string and rewriting
//! matches in place.

use crate::errors::VinError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static FIELD_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*\.([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("regex: field token"));

/// The field values a command template may reference. Built once per task
/// from the host's `HostConfig` and the manifest's own derived values:
/// `ConfigureFlags`, `MakeOpts`, `CFlags`, `CXXFlags`, plus anything the
/// engine injects for a given stage, e.g. `WorkingDir`.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext(HashMap<String, String>);

impl TemplateContext {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn set(&mut self, field: &str, value: impl Into<String>) -> &mut Self {
        self.0.insert(field.to_string(), value.into());
        self
    }
}

/// Expand every `{{ .Field }}` token in `raw` against `ctx`. An unknown field
/// is an error rather than silently blanked — builds must not run
/// partially-substituted commands.
pub fn expand(raw: &str, ctx: &TemplateContext) -> Result<String, VinError> {
    if raw.trim().is_empty() {
        return Err(VinError::EmptyCommand);
    }

    let mut error: Option<VinError> = None;
    let expanded = FIELD_PATTERN.replace_all(raw, |caps: &regex::Captures| {
        let field = &caps[1];
        match ctx.0.get(field) {
            Some(value) => value.clone(),
            None => {
                if error.is_none() {
                    error = Some(VinError::TemplateError {
                        raw: raw.to_string(),
                        msg: format!("unknown field \".{field}\""),
                    });
                }
                String::new()
            }
        }
    });

    if let Some(e) = error {
        return Err(e);
    }

    Ok(expanded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_fields() {
        let mut ctx = TemplateContext::new();
        ctx.set("ConfigureFlags", "--prefix=/usr");

        let out = expand("./configure {{ .ConfigureFlags }}", &ctx).unwrap();
        assert_eq!(out, "./configure --prefix=/usr");
    }

    #[test]
    fn substitutes_multiple_fields_in_one_command() {
        let mut ctx = TemplateContext::new();
        ctx.set("MakeOpts", "-j4");
        ctx.set("WorkingDir", "/var/cache/vin/app/1.0.0");

        let out = expand("make {{ .MakeOpts }} -C {{ .WorkingDir }}", &ctx).unwrap();
        assert_eq!(out, "make -j4 -C /var/cache/vin/app/1.0.0");
    }

    #[test]
    fn unknown_field_is_a_template_error() {
        let ctx = TemplateContext::new();
        let err = expand("./configure {{ .Nonexistent }}", &ctx).unwrap_err();
        assert!(matches!(err, VinError::TemplateError { .. }));
    }

    #[test]
    fn empty_command_is_rejected() {
        let ctx = TemplateContext::new();
        let err = expand("   ", &ctx).unwrap_err();
        assert!(matches!(err, VinError::EmptyCommand));
    }

    #[test]
    fn literal_text_without_tokens_passes_through() {
        let ctx = TemplateContext::new();
        let out = expand("make install", &ctx).unwrap();
        assert_eq!(out, "make install");
    }
}
