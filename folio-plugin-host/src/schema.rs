//! Descriptor extraction and schema validation for exported plugin classes.
//!
//! A plugin exports a class whose uppercase static properties describe it.
//! Validation is fail-fast and ordered per field: presence, then type, then
//! character set, then length. Every error message starts with the field
//! name so callers can surface it verbatim.

use crate::error::{HostResult, PluginHostError};
use boa_engine::{Context, JsObject, JsString, JsValue};
use folio_types::{PluginDescriptor, PluginType};
use url::Url;

const ID_MIN: usize = 16;
const ID_MAX: usize = 32;
const GROUP_MIN: usize = 1;
const GROUP_MAX: usize = 15;
const NAME_MIN: usize = 1;
const NAME_MAX: usize = 15;
const VERSION_MIN: usize = 1;
const VERSION_MAX: usize = 8;

/// Methods every source plugin must carry on its prototype.
const SOURCE_METHODS: &[&str] = &["search", "detail", "chapterText"];

/// Extracts and validates the descriptor of an exported plugin class.
///
/// `class` is the value the script assigned to `plugin.exports`; it must be
/// a constructable object carrying the static descriptor fields.
pub fn validate_export(class: &JsObject, context: &mut Context) -> HostResult<PluginDescriptor> {
    if !class.is_callable() {
        return Err(PluginHostError::Validation(
            "exported plugin must be a class".to_string(),
        ));
    }

    let id = require_string(class, "ID", context)?;
    check_charset("ID", &id, |c| {
        c.is_ascii_alphanumeric() || c == '_' || c == '-'
    })?;
    check_length("ID", &id, ID_MIN, ID_MAX)?;

    let type_code = require_integer(class, "TYPE", context)?;
    let plugin_type = PluginType::from_code(type_code).ok_or_else(|| {
        PluginHostError::Validation(format!("TYPE: unknown plugin type code {type_code}"))
    })?;

    let group = require_string(class, "GROUP", context)?;
    check_no_outer_whitespace("GROUP", &group)?;
    check_length("GROUP", &group, GROUP_MIN, GROUP_MAX)?;

    let name = require_string(class, "NAME", context)?;
    check_no_outer_whitespace("NAME", &name)?;
    check_length("NAME", &name, NAME_MIN, NAME_MAX)?;

    let version = require_string(class, "VERSION", context)?;
    check_no_outer_whitespace("VERSION", &version)?;
    check_length("VERSION", &version, VERSION_MIN, VERSION_MAX)?;

    let version_code = require_integer(class, "VERSION_CODE", context)?;
    if version_code < 0 {
        return Err(PluginHostError::Validation(
            "VERSION_CODE: must not be negative".to_string(),
        ));
    }

    let plugin_file_url = require_string(class, "PLUGIN_FILE_URL", context)?;
    if !plugin_file_url.is_empty() {
        check_http_url("PLUGIN_FILE_URL", &plugin_file_url)?;
        if !plugin_file_url.ends_with(".js") {
            return Err(PluginHostError::Validation(
                "PLUGIN_FILE_URL: must point at a .js file".to_string(),
            ));
        }
    }

    let base_url = require_string(class, "BASE_URL", context)?;
    check_http_url("BASE_URL", &base_url)?;

    // One capability check per declared type; adding a type must extend
    // this match.
    match plugin_type {
        PluginType::Source => check_source_methods(class, context)?,
        PluginType::Store => {
            return Err(PluginHostError::Validation(
                "TYPE: store plugins are not supported".to_string(),
            ));
        }
    }

    Ok(PluginDescriptor {
        id,
        plugin_type,
        group,
        name,
        version,
        version_code,
        plugin_file_url,
        base_url,
    })
}

/// Best-effort probe: does this value satisfy the plugin contract? Swallows
/// the failure reason.
pub fn is_plugin(value: &JsObject, context: &mut Context) -> bool {
    validate_export(value, context).is_ok()
}

fn get_field(class: &JsObject, field: &str, context: &mut Context) -> HostResult<JsValue> {
    class
        .get(JsString::from(field), context)
        .map_err(|e| PluginHostError::Execution(format!("reading {field}: {e}")))
}

fn require_string(class: &JsObject, field: &str, context: &mut Context) -> HostResult<String> {
    let value = get_field(class, field, context)?;
    if value.is_undefined() || value.is_null() {
        return Err(PluginHostError::Validation(format!(
            "{field}: missing required field"
        )));
    }
    let Some(s) = value.as_string() else {
        return Err(PluginHostError::Validation(format!(
            "{field}: must be a string"
        )));
    };
    Ok(s.to_std_string_escaped())
}

fn require_integer(class: &JsObject, field: &str, context: &mut Context) -> HostResult<i64> {
    let value = get_field(class, field, context)?;
    if value.is_undefined() || value.is_null() {
        return Err(PluginHostError::Validation(format!(
            "{field}: missing required field"
        )));
    }
    let Some(n) = value.as_number() else {
        return Err(PluginHostError::Validation(format!(
            "{field}: must be a number"
        )));
    };
    if n.fract() != 0.0 || !n.is_finite() {
        return Err(PluginHostError::Validation(format!(
            "{field}: must be an integer"
        )));
    }
    Ok(n as i64)
}

fn check_charset(field: &str, value: &str, allowed: impl Fn(char) -> bool) -> HostResult<()> {
    if let Some(c) = value.chars().find(|&c| !allowed(c)) {
        return Err(PluginHostError::Validation(format!(
            "{field}: character '{c}' is not allowed"
        )));
    }
    Ok(())
}

fn check_no_outer_whitespace(field: &str, value: &str) -> HostResult<()> {
    if value.trim() != value {
        return Err(PluginHostError::Validation(format!(
            "{field}: leading or trailing whitespace is not allowed"
        )));
    }
    Ok(())
}

fn check_length(field: &str, value: &str, min: usize, max: usize) -> HostResult<()> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(PluginHostError::Validation(format!(
            "{field}: length must be between {min} and {max}, got {len}"
        )));
    }
    Ok(())
}

fn check_http_url(field: &str, value: &str) -> HostResult<()> {
    let url = Url::parse(value)
        .map_err(|e| PluginHostError::Validation(format!("{field}: invalid URL ({e})")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(PluginHostError::Validation(format!(
            "{field}: URL scheme must be http or https"
        )));
    }
    Ok(())
}

fn check_source_methods(class: &JsObject, context: &mut Context) -> HostResult<()> {
    let proto = get_field(class, "prototype", context)?;
    let Some(proto) = proto.as_object() else {
        return Err(PluginHostError::Validation(
            "exported plugin has no prototype".to_string(),
        ));
    };
    for method in SOURCE_METHODS {
        let value = proto
            .get(JsString::from(*method), context)
            .map_err(|e| PluginHostError::Execution(format!("reading {method}: {e}")))?;
        let callable = value
            .as_object()
            .map(|o| o.is_callable())
            .unwrap_or(false);
        if !callable {
            return Err(PluginHostError::Validation(format!(
                "{method}: source plugins must implement this method"
            )));
        }
    }
    Ok(())
}
