//! Host-side capability implementations handed to sandboxed plugins.
//!
//! Everything a plugin can do beyond pure computation flows through the
//! native functions registered here: HTTP, the per-plugin key-value store,
//! markup parsing, id generation and logging. The functions are grouped on
//! a single `__host__` object that the sandbox bootstrap wires into the
//! capability surface; plugin code never sees `__host__` itself.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use boa_engine::object::ObjectInitializer;
use boa_engine::property::Attribute;
use boa_engine::{
    Context, JsArgs, JsNativeError, JsResult, JsString, JsValue, NativeFunction, js_string,
};
use folio_storage::PluginStore;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use scraper::{Html, Selector};
use tracing::{info, warn};

use crate::error::{HostResult, PluginHostError};
use crate::settings::ProxyConfig;

/// Resolved proxy decision for one plugin instance.
#[derive(Debug, Clone)]
pub enum ProxyBinding {
    /// Plugin did not ask for the proxy; direct connections.
    Direct,
    /// Plugin asked and the settings provide an endpoint.
    Proxied(ProxyConfig),
    /// Plugin asked but the proxy is off; every HTTP call fails.
    RequestedDisabled,
}

impl ProxyBinding {
    /// Resolves the binding from the plugin's request and the live settings.
    pub fn resolve(use_proxy: bool, settings: &dyn crate::settings::Settings) -> Self {
        if !use_proxy {
            return Self::Direct;
        }
        match settings.proxy().filter(|_| settings.proxy_enabled()) {
            Some(cfg) => Self::Proxied(cfg),
            None => Self::RequestedDisabled,
        }
    }
}

/// Per-instance state captured by the native capability functions.
///
/// The plugin id and store are not known until the script has been
/// evaluated, its descriptor validated and the conflict check passed, so
/// they bind late. Store access before binding is an error; logging falls
/// back to a placeholder id.
pub struct HostCtx {
    plugin_id: OnceLock<String>,
    store: OnceLock<Arc<PluginStore>>,
    client: Option<Client>,
}

/// What the native closures actually capture. No JS heap references
/// inside, so the trace is empty.
#[derive(Clone)]
struct HostHandle(Arc<HostCtx>);

impl boa_gc::Finalize for HostHandle {}

unsafe impl boa_gc::Trace for HostHandle {
    boa_gc::empty_trace!();
}

impl std::ops::Deref for HostHandle {
    type Target = HostCtx;

    fn deref(&self) -> &HostCtx {
        &self.0
    }
}

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("folio-plugin-host/", env!("CARGO_PKG_VERSION"));

impl HostCtx {
    pub fn new(binding: ProxyBinding) -> HostResult<Self> {
        let builder = Client::builder().timeout(HTTP_TIMEOUT).user_agent(USER_AGENT);
        let client = match binding {
            ProxyBinding::RequestedDisabled => None,
            ProxyBinding::Direct => Some(
                builder
                    .build()
                    .map_err(|e| PluginHostError::Network(e.to_string()))?,
            ),
            ProxyBinding::Proxied(cfg) => {
                let proxy = reqwest::Proxy::all(&cfg.url)
                    .map_err(|e| PluginHostError::Network(e.to_string()))?;
                Some(
                    builder
                        .proxy(proxy)
                        .build()
                        .map_err(|e| PluginHostError::Network(e.to_string()))?,
                )
            }
        };
        Ok(Self {
            plugin_id: OnceLock::new(),
            store: OnceLock::new(),
            client,
        })
    }

    /// Binds the validated plugin id and its store. Called once, after the
    /// conflict check passes.
    pub fn bind(&self, plugin_id: String, store: Arc<PluginStore>) {
        let _ = self.plugin_id.set(plugin_id);
        let _ = self.store.set(store);
    }

    fn client(&self) -> JsResult<&Client> {
        self.client.as_ref().ok_or_else(|| {
            JsNativeError::error()
                .with_message(PluginHostError::ProxyNotEnabled.to_string())
                .into()
        })
    }

    fn store(&self) -> JsResult<&Arc<PluginStore>> {
        self.store.get().ok_or_else(|| {
            JsNativeError::error()
                .with_message("plugin store is not available during import")
                .into()
        })
    }

    fn log_id(&self) -> &str {
        self.plugin_id.get().map(String::as_str).unwrap_or("import")
    }
}

/// Builds the `__host__` object and registers it as a hidden global.
///
/// The bootstrap consumes it; the name is not in the sandbox allow-list so
/// plugin code cannot reach it.
pub fn register_host(ctx: Arc<HostCtx>, context: &mut Context) -> HostResult<()> {
    let ctx = HostHandle(ctx);
    let host = ObjectInitializer::new(context)
        .function(
            NativeFunction::from_copy_closure_with_captures(http_get, ctx.clone()),
            js_string!("httpGet"),
            2,
        )
        .function(
            NativeFunction::from_copy_closure_with_captures(http_post, ctx.clone()),
            js_string!("httpPost"),
            3,
        )
        .function(
            NativeFunction::from_copy_closure_with_captures(store_get, ctx.clone()),
            js_string!("storeGet"),
            1,
        )
        .function(
            NativeFunction::from_copy_closure_with_captures(store_set, ctx.clone()),
            js_string!("storeSet"),
            2,
        )
        .function(
            NativeFunction::from_copy_closure_with_captures(store_remove, ctx.clone()),
            js_string!("storeRemove"),
            1,
        )
        .function(
            NativeFunction::from_copy_closure(parse_markup),
            js_string!("parseMarkup"),
            2,
        )
        .function(NativeFunction::from_copy_closure(new_uuid), js_string!("uuid"), 0)
        .function(
            NativeFunction::from_copy_closure_with_captures(console_log, ctx.clone()),
            js_string!("log"),
            1,
        )
        .function(
            NativeFunction::from_copy_closure_with_captures(console_warn, ctx),
            js_string!("warn"),
            1,
        )
        .build();

    context
        .register_global_property(js_string!("__host__"), host, Attribute::empty())
        .map_err(|e| PluginHostError::Execution(format!("registering host object: {e}")))?;
    Ok(())
}

fn js_error(message: impl Into<String>) -> boa_engine::JsError {
    JsNativeError::error().with_message(message.into()).into()
}

fn arg_string(args: &[JsValue], index: usize, what: &str) -> JsResult<String> {
    args.get_or_undefined(index)
        .as_string()
        .map(|s| s.to_std_string_escaped())
        .ok_or_else(|| JsNativeError::typ().with_message(format!("{what} must be a string")).into())
}

/// Options accepted by the HTTP capabilities: `{ query, headers, charset }`,
/// each optional. `charset` is the decoding fallback when the response
/// declares none.
#[derive(Default)]
struct RequestOptions {
    query: Vec<(String, String)>,
    headers: HeaderMap,
    charset: Option<String>,
}

fn request_options(
    args: &[JsValue],
    index: usize,
    context: &mut Context,
) -> JsResult<RequestOptions> {
    let mut options = RequestOptions::default();
    let value = args.get_or_undefined(index);
    if value.is_undefined() || value.is_null() {
        return Ok(options);
    }
    let json = value.to_json(context)?;
    let Some(fields) = json.as_object() else {
        return Err(JsNativeError::typ()
            .with_message("request options must be an object")
            .into());
    };
    for (key, val) in fields {
        match key.as_str() {
            "query" => options.query = string_pairs("query", val)?,
            "headers" => {
                for (name, text) in string_pairs("headers", val)? {
                    let name = HeaderName::from_bytes(name.as_bytes())
                        .map_err(|e| js_error(format!("invalid header name '{name}': {e}")))?;
                    let value = HeaderValue::from_str(&text)
                        .map_err(|e| js_error(format!("invalid header value for {name:?}: {e}")))?;
                    options.headers.insert(name, value);
                }
            }
            "charset" => {
                let Some(text) = val.as_str() else {
                    return Err(JsNativeError::typ()
                        .with_message("charset must be a string")
                        .into());
                };
                options.charset = Some(text.to_string());
            }
            other => {
                return Err(JsNativeError::typ()
                    .with_message(format!("unknown request option '{other}'"))
                    .into());
            }
        }
    }
    Ok(options)
}

fn string_pairs(what: &str, value: &serde_json::Value) -> JsResult<Vec<(String, String)>> {
    let Some(entries) = value.as_object() else {
        return Err(JsNativeError::typ()
            .with_message(format!("{what} must be an object of strings"))
            .into());
    };
    let mut pairs = Vec::with_capacity(entries.len());
    for (key, val) in entries {
        let Some(val) = val.as_str() else {
            return Err(JsNativeError::typ()
                .with_message(format!("{what} entry '{key}' must be a string"))
                .into());
        };
        pairs.push((key.clone(), val.to_string()));
    }
    Ok(pairs)
}

/// Converts a response into the `{ code, body, headers }` shape plugins
/// see. Non-UTF-8 header values are dropped.
fn response_object(
    response: reqwest::blocking::Response,
    charset: Option<&str>,
    context: &mut Context,
) -> JsResult<JsValue> {
    let code = response.status().as_u16();
    let mut headers = serde_json::Map::new();
    for (name, value) in response.headers() {
        if let Ok(text) = value.to_str() {
            headers.insert(name.as_str().to_string(), serde_json::Value::from(text));
        }
    }
    let body = response
        .text_with_charset(charset.unwrap_or("utf-8"))
        .map_err(|e| js_error(format!("reading response body: {e}")))?;

    let headers = JsValue::from_json(&serde_json::Value::Object(headers), context)?;
    let object = ObjectInitializer::new(context)
        .property(js_string!("code"), i32::from(code), Attribute::all())
        .property(js_string!("body"), JsString::from(body.as_str()), Attribute::all())
        .property(js_string!("headers"), headers, Attribute::all())
        .build();
    Ok(object.into())
}

fn http_get(
    _this: &JsValue,
    args: &[JsValue],
    ctx: &HostHandle,
    context: &mut Context,
) -> JsResult<JsValue> {
    let url = arg_string(args, 0, "url")?;
    let options = request_options(args, 1, context)?;
    let mut request = ctx.client()?.get(&url).headers(options.headers);
    if !options.query.is_empty() {
        request = request.query(&options.query);
    }
    let response = request
        .send()
        .map_err(|e| js_error(format!("http get {url}: {e}")))?;
    response_object(response, options.charset.as_deref(), context)
}

fn http_post(
    _this: &JsValue,
    args: &[JsValue],
    ctx: &HostHandle,
    context: &mut Context,
) -> JsResult<JsValue> {
    let url = arg_string(args, 0, "url")?;
    let body = arg_string(args, 1, "body")?;
    let options = request_options(args, 2, context)?;
    let mut request = ctx
        .client()?
        .post(&url)
        .headers(options.headers)
        .body(body);
    if !options.query.is_empty() {
        request = request.query(&options.query);
    }
    let response = request
        .send()
        .map_err(|e| js_error(format!("http post {url}: {e}")))?;
    response_object(response, options.charset.as_deref(), context)
}

fn store_get(
    _this: &JsValue,
    args: &[JsValue],
    ctx: &HostHandle,
    context: &mut Context,
) -> JsResult<JsValue> {
    let key = arg_string(args, 0, "key")?;
    match ctx.store()?.get(&key) {
        Some(value) => JsValue::from_json(&value, context),
        None => Ok(JsValue::null()),
    }
}

fn store_set(
    _this: &JsValue,
    args: &[JsValue],
    ctx: &HostHandle,
    context: &mut Context,
) -> JsResult<JsValue> {
    let key = arg_string(args, 0, "key")?;
    let value = args.get_or_undefined(1);
    let json = if value.is_undefined() {
        serde_json::Value::Null
    } else {
        value.to_json(context)?
    };
    ctx.store()?
        .set(&key, json)
        .map_err(|e| js_error(e.to_string()))?;
    Ok(JsValue::undefined())
}

fn store_remove(
    _this: &JsValue,
    args: &[JsValue],
    ctx: &HostHandle,
    _context: &mut Context,
) -> JsResult<JsValue> {
    let key = arg_string(args, 0, "key")?;
    ctx.store()?.remove(&key);
    Ok(JsValue::undefined())
}

/// Parses an HTML fragment and selects elements with a CSS selector,
/// returning `[{text, html}]` per match.
fn parse_markup(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let html = arg_string(args, 0, "html")?;
    let selector_text = arg_string(args, 1, "selector")?;
    let selector = Selector::parse(&selector_text)
        .map_err(|e| js_error(format!("invalid selector '{selector_text}': {e}")))?;
    let document = Html::parse_fragment(&html);

    let mut matches = Vec::new();
    for element in document.select(&selector) {
        let text: String = element.text().collect();
        matches.push(serde_json::json!({
            "text": text,
            "html": element.html(),
        }));
    }
    JsValue::from_json(&serde_json::Value::Array(matches), context)
}

fn new_uuid(_this: &JsValue, _args: &[JsValue], _context: &mut Context) -> JsResult<JsValue> {
    Ok(JsString::from(uuid::Uuid::new_v4().to_string().as_str()).into())
}

fn join_args(args: &[JsValue], context: &mut Context) -> String {
    args.iter()
        .map(|v| {
            v.to_string(context)
                .map(|s| s.to_std_string_escaped())
                .unwrap_or_else(|_| "<unprintable>".to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn console_log(
    _this: &JsValue,
    args: &[JsValue],
    ctx: &HostHandle,
    context: &mut Context,
) -> JsResult<JsValue> {
    info!(plugin = %ctx.log_id(), "{}", join_args(args, context));
    Ok(JsValue::undefined())
}

fn console_warn(
    _this: &JsValue,
    args: &[JsValue],
    ctx: &HostHandle,
    context: &mut Context,
) -> JsResult<JsValue> {
    warn!(plugin = %ctx.log_id(), "{}", join_args(args, context));
    Ok(JsValue::undefined())
}
