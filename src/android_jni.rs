use crate::bridge::{
    BridgeCall, CallbackId, CallbackRegistry, Delivery, DeliveryStatus, NativeBridge,
};
use crate::error::{throw_java_exception, GResult, GeolocationError};
use jni::objects::{GlobalRef, JClass, JObject, JString, JValue};
use jni::sys::{jboolean, jint, jlong, JNI_FALSE};
use jni::{JNIEnv, JavaVM};
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Java method invoked for every call: `void exec(String action, String argsJson, long callbackId)`
const EXEC_METHOD: &str = "exec";
const EXEC_SIGNATURE: &str = "(Ljava/lang/String;Ljava/lang/String;J)V";

// Bridge installed by the Java plugin - stored as static to persist across JNI calls
lazy_static::lazy_static! {
    static ref INSTALLED_BRIDGE: Mutex<Option<Arc<JniBridge>>> = Mutex::new(None);
}

/// Native collaborator reached over JNI.
///
/// Calls go out through the Java plugin's `exec`; results come back through
/// `deliverResult` on whatever thread Java uses and are queued until
/// [`JniBridge::dispatch_pending`] runs them.
pub struct JniBridge {
    vm: JavaVM,
    plugin: GlobalRef,
    registry: CallbackRegistry,
}

impl JniBridge {
    pub fn new(env: &mut JNIEnv, plugin: &JObject) -> GResult<Self> {
        Ok(JniBridge {
            vm: env.get_java_vm()?,
            plugin: env.new_global_ref(plugin)?,
            registry: CallbackRegistry::new(),
        })
    }

    /// Bridge registered by `nativeInit`
    pub fn installed() -> GResult<Arc<JniBridge>> {
        INSTALLED_BRIDGE
            .lock()
            .map_err(|_| GeolocationError::Internal("Failed to acquire bridge lock".to_string()))?
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| GeolocationError::Bridge("nativeInit has not been called".to_string()))
    }

    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    /// Run queued native results on the calling thread
    pub fn dispatch_pending(&self) -> GResult<usize> {
        self.registry.dispatch_pending()
    }
}

impl NativeBridge for JniBridge {
    fn exec(&self, call: BridgeCall) -> GResult<()> {
        let args_json = serde_json::to_string(&call.args)?;
        let action = call.action;
        let callback_id = self.registry.register(call.callbacks)?;

        let result = (|| -> GResult<()> {
            let mut env = self.vm.attach_current_thread()?;
            let j_action = env.new_string(action.as_str())?;
            let j_args = env.new_string(&args_json)?;
            env.call_method(
                self.plugin.as_obj(),
                EXEC_METHOD,
                EXEC_SIGNATURE,
                &[
                    JValue::Object(&j_action),
                    JValue::Object(&j_args),
                    JValue::Long(callback_id as jlong),
                ],
            )?;
            Ok(())
        })();

        if let Err(e) = &result {
            log::error!("{}.{} failed: {}", call.service, action.as_str(), e);
            self.registry.unregister(callback_id)?;
        }
        result
    }
}

/// JNI: Install the bridge, called once by the Java plugin with itself
/// Returns: 0 on success, -1 on error (throws Java exception)
#[no_mangle]
pub extern "C" fn Java_com_example_bggeo_JniBinding_nativeInit(
    mut env: JNIEnv,
    _class: JClass,
    plugin: JObject,
) -> jint {
    match native_init_impl(&mut env, &plugin) {
        Ok(_) => 0,
        Err(e) => {
            let _ = throw_java_exception(&mut env, &e);
            -1
        }
    }
}

fn native_init_impl(env: &mut JNIEnv, plugin: &JObject) -> GResult<()> {
    crate::logging::init();
    let bridge = Arc::new(JniBridge::new(env, plugin)?);
    *INSTALLED_BRIDGE
        .lock()
        .map_err(|_| GeolocationError::Internal("Failed to acquire bridge lock".to_string()))? =
        Some(bridge);

    log::info!("Native bridge installed");
    Ok(())
}

/// JNI: Post a plugin result for a callback id
/// Parameters: callbackId, ok (false routes to the failure callback), payload JSON, keepCallback
/// Returns: 0 on success, -1 on error (throws Java exception)
#[no_mangle]
pub extern "C" fn Java_com_example_bggeo_JniBinding_deliverResult(
    mut env: JNIEnv,
    _class: JClass,
    callback_id: jlong,
    ok: jboolean,
    payload: JString,
    keep_callback: jboolean,
) -> jint {
    match deliver_result_impl(&mut env, callback_id, ok, &payload, keep_callback) {
        Ok(_) => 0,
        Err(e) => {
            let _ = throw_java_exception(&mut env, &e);
            -1
        }
    }
}

fn deliver_result_impl(
    env: &mut JNIEnv,
    callback_id: jlong,
    ok: jboolean,
    payload: &JString,
    keep_callback: jboolean,
) -> GResult<()> {
    let payload: String = env.get_string(payload)?.into();
    let delivery = build_delivery(callback_id, ok, &payload, keep_callback)?;
    JniBridge::installed()?.registry.post(delivery)
}

/// JNI: Run queued results on the calling thread
/// Returns: number of callbacks run, -1 on error (throws Java exception)
#[no_mangle]
pub extern "C" fn Java_com_example_bggeo_JniBinding_dispatchPending(
    mut env: JNIEnv,
    _class: JClass,
) -> jint {
    match JniBridge::installed().and_then(|bridge| bridge.dispatch_pending()) {
        Ok(count) => count as jint,
        Err(e) => {
            let _ = throw_java_exception(&mut env, &e);
            -1
        }
    }
}

fn build_delivery(
    callback_id: jlong,
    ok: jboolean,
    payload: &str,
    keep_callback: jboolean,
) -> GResult<Delivery> {
    let payload = if payload.trim().is_empty() {
        Value::Null
    } else {
        serde_json::from_str(payload)?
    };
    Ok(Delivery {
        callback_id: callback_id as CallbackId,
        status: if ok == JNI_FALSE {
            DeliveryStatus::Error
        } else {
            DeliveryStatus::Ok
        },
        payload,
        keep_callback: keep_callback != JNI_FALSE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jni::sys::JNI_TRUE;
    use serde_json::json;

    #[test]
    fn test_build_delivery() {
        let delivery = build_delivery(7, JNI_TRUE, r#"{"taskId":"t1"}"#, JNI_FALSE).unwrap();
        assert_eq!(delivery.callback_id, 7);
        assert_eq!(delivery.status, DeliveryStatus::Ok);
        assert_eq!(delivery.payload, json!({"taskId": "t1"}));
        assert!(!delivery.keep_callback);

        let delivery = build_delivery(8, JNI_FALSE, "", JNI_TRUE).unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Error);
        assert_eq!(delivery.payload, Value::Null);
        assert!(delivery.keep_callback);

        assert!(build_delivery(9, JNI_TRUE, "{oops", JNI_FALSE).is_err());
    }

    #[test]
    fn test_not_installed() {
        assert!(JniBridge::installed().is_err());
    }
}
