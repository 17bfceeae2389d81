//! Capability sandbox for plugin script execution.
//!
//! Each plugin instance owns a dedicated worker thread holding its JS
//! context; the context type is not `Send`, so all evaluation happens on
//! that thread and the rest of the host talks to it over channels. The
//! import handshake is two-phase: the worker evaluates the script and
//! validates its descriptor, then waits for the registry's conflict-check
//! verdict before it binds a store and constructs the instance.
//!
//! Inside the context, a trusted bootstrap script walls the plugin off from
//! the real global object. Free names in plugin code resolve against a
//! `with`-scope proxy that only knows the allow-listed surface; values read
//! through it are recursively proxied so that no property walk reaches the
//! real global or a live function constructor. Static validation rejects
//! most escapes before execution; this layer catches scripts imported with
//! validation skipped.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use boa_engine::builtins::promise::PromiseState;
use boa_engine::object::builtins::JsPromise;
use boa_engine::{Context, JsError, JsObject, JsString, JsValue, Source};
use folio_storage::StoreManager;
use folio_types::PluginDescriptor;
use serde_json::Value;
use tracing::debug;

use crate::error::{HostResult, PluginHostError};
use crate::host_impl::{HostCtx, ProxyBinding, register_host};
use crate::schema;

/// Trusted setup script, evaluated before any plugin code.
///
/// Builds the allow-listed container, the recursive wrapping proxy and the
/// scope proxy, hardens the function-constructor escape hatch, and parks
/// the export slot where the host can reach it.
const BOOTSTRAP: &str = r#"
(function () {
    "use strict";
    var realGlobal = globalThis;
    var host = __host__;

    function deny(name) {
        throw new Error("permission denied: " + name);
    }

    // Reaching Function through any function's constructor chain would hand
    // the plugin an evaluator for unaudited source. Replace the constructor
    // slot on every function prototype flavour with a denier.
    function sealConstructor(sample) {
        var proto = Object.getPrototypeOf(sample);
        Object.defineProperty(proto, "constructor", {
            value: function () { deny("Function"); },
            writable: false,
            enumerable: false,
            configurable: false,
        });
    }
    sealConstructor(function () {});
    sealConstructor(function* () {});
    sealConstructor(async function () {});
    sealConstructor(async function* () {});

    var container = Object.create(null);
    container.Number = Number;
    container.Date = Date;
    container.Math = Math;
    container.RegExp = RegExp;
    container.JSON = JSON;
    container.Promise = Promise;
    container.undefined = undefined;
    container.NaN = NaN;
    container.Infinity = Infinity;
    container.isNull = function (v) { return v === null; };
    container.isUndefined = function (v) { return v === undefined; };
    container.isString = function (v) { return typeof v === "string"; };
    container.isNumber = function (v) { return typeof v === "number" && !Number.isNaN(v); };
    container.isArray = function (v) { return Array.isArray(v); };
    container.isDate = function (v) { return v instanceof Date; };
    container.isFunction = function (v) { return typeof v === "function"; };

    // Timers run inline; the host drives each context synchronously and an
    // interval fires exactly once.
    container.setTimeout = function (fn) { if (typeof fn === "function") { fn(); } return 0; };
    container.setInterval = function (fn) { if (typeof fn === "function") { fn(); } return 0; };
    container.clearInterval = function () {};

    container.parseQuery = function (qs) {
        var out = {};
        if (typeof qs !== "string" || qs.length === 0) { return out; }
        if (qs.charAt(0) === "?") { qs = qs.slice(1); }
        var parts = qs.split("&");
        for (var i = 0; i < parts.length; i++) {
            if (parts[i].length === 0) { continue; }
            var eq = parts[i].indexOf("=");
            var key = eq < 0 ? parts[i] : parts[i].slice(0, eq);
            var value = eq < 0 ? "" : parts[i].slice(eq + 1);
            out[decodeURIComponent(key)] = decodeURIComponent(value.replace(/\+/g, " "));
        }
        return out;
    };

    container.PLUGIN_TYPE = { SOURCE: 1, STORE: 2 };
    container.console = {
        log: host.log,
        info: host.log,
        debug: host.log,
        warn: host.warn,
        error: host.warn,
    };

    var pluginBox = { exports: undefined };
    container.plugin = pluginBox;

    var wrapped = new WeakMap();
    function wrap(value) {
        if (value === realGlobal) { deny("globalThis"); }
        if (value === null || (typeof value !== "object" && typeof value !== "function")) {
            return value;
        }
        if (wrapped.has(value)) { return wrapped.get(value); }
        var proxy = new Proxy(value, {
            get: function (target, prop) {
                var raw = Reflect.get(target, prop, target);
                if (raw === realGlobal) { deny(String(prop)); }
                var desc = Object.getOwnPropertyDescriptor(target, prop);
                if (desc && desc.configurable === false && desc.writable === false) {
                    // Proxy invariant: non-configurable non-writable data
                    // properties must be reported as-is.
                    return raw;
                }
                return wrap(raw);
            },
            set: function (target, prop, incoming) {
                if (target === pluginBox && prop === "exports") {
                    return Reflect.set(target, prop, incoming);
                }
                deny("assignment to " + String(prop));
            },
        });
        wrapped.set(value, proxy);
        return proxy;
    }

    var scope = new Proxy(container, {
        has: function () { return true; },
        get: function (target, prop) {
            if (prop === Symbol.unscopables) { return undefined; }
            if (!(prop in target)) { deny(String(prop)); }
            return wrap(target[prop]);
        },
        set: function (target, prop) {
            deny("assignment to " + String(prop));
        },
    });

    realGlobal.__scope__ = scope;
    realGlobal.__exports__ = pluginBox;
    realGlobal.__construct__ = function (Cls, caps) { return new Cls(caps); };
})();
"#;

/// Builds the capability object handed to the plugin constructor.
const CAPS: &str = r#"
({
    http: {
        get: __host__.httpGet,
        post: __host__.httpPost,
    },
    store: {
        get: __host__.storeGet,
        set: __host__.storeSet,
        remove: __host__.storeRemove,
    },
    parseMarkup: __host__.parseMarkup,
    uuid: __host__.uuid,
})
"#;

/// Instance properties backfilled from the capability object when the
/// constructor did not keep them.
const CAP_FIELDS: &[&str] = &["http", "store", "parseMarkup", "uuid"];

enum Decision {
    Proceed,
    Abort,
}

enum WorkerMsg {
    Call {
        method: String,
        args: Vec<Value>,
        reply: mpsc::Sender<HostResult<Value>>,
    },
    Shutdown,
}

/// A script that evaluated cleanly and produced a valid descriptor, parked
/// on its worker thread awaiting the registry's verdict.
#[derive(Debug)]
pub struct SandboxLaunch {
    descriptor: PluginDescriptor,
    decision_tx: mpsc::Sender<Decision>,
    built_rx: mpsc::Receiver<HostResult<()>>,
    calls_tx: mpsc::Sender<WorkerMsg>,
    join: thread::JoinHandle<()>,
}

impl SandboxLaunch {
    pub fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }

    /// Tears the worker down without constructing an instance.
    pub fn abort(self) {
        let _ = self.decision_tx.send(Decision::Abort);
        let _ = self.join.join();
    }

    /// Lets the worker bind its store, construct the plugin instance and
    /// enter its call loop.
    pub fn proceed(self) -> HostResult<PluginInstance> {
        self.decision_tx
            .send(Decision::Proceed)
            .map_err(|_| worker_gone())?;
        self.built_rx.recv().map_err(|_| worker_gone())??;
        Ok(PluginInstance {
            id: self.descriptor.id,
            calls_tx: self.calls_tx,
            join: Some(self.join),
        })
    }
}

/// Live plugin instance. Methods are invoked by name with JSON arguments;
/// results come back as JSON. Dropping the handle shuts the worker down.
pub struct PluginInstance {
    id: String,
    calls_tx: mpsc::Sender<WorkerMsg>,
    join: Option<thread::JoinHandle<()>>,
}

impl PluginInstance {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn call(&self, method: &str, args: Vec<Value>) -> HostResult<Value> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.calls_tx
            .send(WorkerMsg::Call {
                method: method.to_string(),
                args,
                reply: reply_tx,
            })
            .map_err(|_| worker_gone())?;
        reply_rx.recv().map_err(|_| worker_gone())?
    }
}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        let _ = self.calls_tx.send(WorkerMsg::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn worker_gone() -> PluginHostError {
    PluginHostError::Execution("sandbox worker exited unexpectedly".to_string())
}

/// Evaluates `source` in a fresh sandbox on a new worker thread.
///
/// Returns once the script has run and its descriptor validated; failures
/// anywhere up to that point surface here and the worker is gone. The store
/// for the plugin is not created until [`SandboxLaunch::proceed`].
pub fn launch(
    source: &str,
    stores: Arc<StoreManager>,
    binding: ProxyBinding,
) -> HostResult<SandboxLaunch> {
    let (ready_tx, ready_rx) = mpsc::channel();
    let (decision_tx, decision_rx) = mpsc::channel();
    let (built_tx, built_rx) = mpsc::channel();
    let (calls_tx, calls_rx) = mpsc::channel();

    let source = source.to_string();
    let join = thread::Builder::new()
        .name("plugin-sandbox".to_string())
        .spawn(move || {
            worker_main(source, stores, binding, ready_tx, decision_rx, built_tx, calls_rx);
        })?;

    let descriptor = match ready_rx.recv() {
        Ok(Ok(descriptor)) => descriptor,
        Ok(Err(e)) => {
            let _ = join.join();
            return Err(e);
        }
        Err(_) => {
            let _ = join.join();
            return Err(worker_gone());
        }
    };

    Ok(SandboxLaunch {
        descriptor,
        decision_tx,
        built_rx,
        calls_tx,
        join,
    })
}

fn worker_main(
    source: String,
    stores: Arc<StoreManager>,
    binding: ProxyBinding,
    ready_tx: mpsc::Sender<HostResult<PluginDescriptor>>,
    decision_rx: mpsc::Receiver<Decision>,
    built_tx: mpsc::Sender<HostResult<()>>,
    calls_rx: mpsc::Receiver<WorkerMsg>,
) {
    let (mut context, host_ctx, export) = match boot(&source, binding) {
        Ok(parts) => parts,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let descriptor = match schema::validate_export(&export, &mut context) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let plugin_id = descriptor.id.clone();

    if ready_tx.send(Ok(descriptor)).is_err() {
        return;
    }
    match decision_rx.recv() {
        Ok(Decision::Proceed) => {}
        Ok(Decision::Abort) | Err(_) => {
            debug!(plugin = %plugin_id, "sandbox aborted before construction");
            return;
        }
    }

    host_ctx.bind(plugin_id.clone(), stores.get(&plugin_id));
    let instance = match build_instance(&export, &mut context) {
        Ok(instance) => instance,
        Err(e) => {
            let _ = built_tx.send(Err(e));
            return;
        }
    };
    if built_tx.send(Ok(())).is_err() {
        return;
    }

    debug!(plugin = %plugin_id, "sandbox serving calls");
    serve(instance, context, calls_rx);
}

/// Creates the context, registers the host surface, runs the bootstrap and
/// the plugin script, and pulls out the export.
fn boot(source: &str, binding: ProxyBinding) -> HostResult<(Context, Arc<HostCtx>, JsObject)> {
    let mut context = Context::default();
    let host_ctx = Arc::new(HostCtx::new(binding)?);
    register_host(host_ctx.clone(), &mut context)?;

    context
        .eval(Source::from_bytes(BOOTSTRAP))
        .map_err(|e| PluginHostError::Execution(format!("sandbox bootstrap failed: {e}")))?;

    // Free names inside the function resolve against the scope proxy;
    // declarations stay local to the function. The strict directive keeps
    // top-level `this` undefined instead of the real global object.
    let framed =
        format!("with (__scope__) {{ (function () {{ \"use strict\";\n{source}\n}})(); }}");
    context
        .eval(Source::from_bytes(&framed))
        .map_err(|e| script_error(&e))?;

    let exports_box = context
        .global_object()
        .get(JsString::from("__exports__"), &mut context)
        .map_err(|e| PluginHostError::Execution(format!("reading exports: {e}")))?;
    let exports_box = exports_box
        .as_object()
        .ok_or_else(|| PluginHostError::Execution("exports slot missing".to_string()))?
        .clone();
    let export = exports_box
        .get(JsString::from("exports"), &mut context)
        .map_err(|e| PluginHostError::Execution(format!("reading exports: {e}")))?;

    if export.is_undefined() || export.is_null() {
        return Err(PluginHostError::NoExport);
    }
    let Some(export) = export.as_object() else {
        return Err(PluginHostError::Validation(
            "exported plugin must be a class".to_string(),
        ));
    };
    let export = export.clone();
    Ok((context, host_ctx, export))
}

/// Maps a thrown JS error, routing sandbox denials to the permission
/// variant.
fn script_error(error: &JsError) -> PluginHostError {
    let message = error.to_string();
    match message.split_once("permission denied: ") {
        Some((_, denied)) => PluginHostError::PermissionDenied(denied.to_string()),
        None => PluginHostError::Execution(message),
    }
}

fn build_instance(export: &JsObject, context: &mut Context) -> HostResult<JsObject> {
    let caps = context
        .eval(Source::from_bytes(CAPS))
        .map_err(|e| PluginHostError::Execution(format!("building capabilities: {e}")))?;
    let caps_obj = caps
        .as_object()
        .ok_or_else(|| PluginHostError::Execution("capability object missing".to_string()))?
        .clone();

    let construct = context
        .global_object()
        .get(JsString::from("__construct__"), context)
        .map_err(|e| PluginHostError::Execution(format!("reading constructor helper: {e}")))?;
    let construct = construct
        .as_object()
        .ok_or_else(|| PluginHostError::Execution("constructor helper missing".to_string()))?
        .clone();
    let instance = construct
        .call(
            &JsValue::undefined(),
            &[export.clone().into(), caps.clone()],
            context,
        )
        .map_err(|e| script_error(&e))?;
    let instance = instance
        .as_object()
        .ok_or_else(|| {
            PluginHostError::Execution("plugin constructor returned no object".to_string())
        })?
        .clone();

    // Plugins written against older hosts expect the capabilities as
    // instance properties whether or not their constructor stored them.
    for field in CAP_FIELDS {
        let current = instance
            .get(JsString::from(*field), context)
            .map_err(|e| script_error(&e))?;
        if current.is_undefined() {
            let value = caps_obj
                .get(JsString::from(*field), context)
                .map_err(|e| PluginHostError::Execution(format!("reading capability: {e}")))?;
            instance
                .set(JsString::from(*field), value, false, context)
                .map_err(|e| script_error(&e))?;
        }
    }

    Ok(instance)
}

fn serve(instance: JsObject, mut context: Context, calls_rx: mpsc::Receiver<WorkerMsg>) {
    while let Ok(msg) = calls_rx.recv() {
        match msg {
            WorkerMsg::Shutdown => break,
            WorkerMsg::Call {
                method,
                args,
                reply,
            } => {
                let result = dispatch(&instance, &method, &args, &mut context);
                let _ = reply.send(result);
            }
        }
    }
}

fn dispatch(
    instance: &JsObject,
    method: &str,
    args: &[Value],
    context: &mut Context,
) -> HostResult<Value> {
    let target = instance
        .get(JsString::from(method), context)
        .map_err(|e| script_error(&e))?;
    let callable = target
        .as_object()
        .filter(|o| o.is_callable())
        .cloned()
        .ok_or_else(|| PluginHostError::NotFound(format!("plugin method '{method}'")))?;

    let mut js_args = Vec::with_capacity(args.len());
    for arg in args {
        js_args.push(
            JsValue::from_json(arg, context)
                .map_err(|e| PluginHostError::Execution(format!("converting argument: {e}")))?,
        );
    }

    let result = callable
        .call(&instance.clone().into(), &js_args, context)
        .map_err(|e| script_error(&e))?;
    let result = settle(result, context)?;

    if result.is_undefined() {
        return Ok(Value::Null);
    }
    result
        .to_json(context)
        .map_err(|e| PluginHostError::Execution(format!("converting result: {e}")))
}

/// Drives the job queue and unwraps a promise result; plain values pass
/// through.
fn settle(value: JsValue, context: &mut Context) -> HostResult<JsValue> {
    let Some(object) = value.as_object() else {
        return Ok(value);
    };
    let Ok(promise) = JsPromise::from_object(object.clone()) else {
        return Ok(value);
    };
    context.run_jobs();
    match promise.state() {
        PromiseState::Fulfilled(inner) => Ok(inner),
        PromiseState::Rejected(reason) => {
            let text = reason
                .to_string(context)
                .map(|s| s.to_std_string_escaped())
                .unwrap_or_else(|_| "<unprintable>".to_string());
            match text.split_once("permission denied: ") {
                Some((_, denied)) => Err(PluginHostError::PermissionDenied(denied.to_string())),
                None => Err(PluginHostError::Execution(format!(
                    "plugin promise rejected: {text}"
                ))),
            }
        }
        PromiseState::Pending => Err(PluginHostError::Execution(
            "plugin promise never settled".to_string(),
        )),
    }
}
