use std::time::{SystemTime, UNIX_EPOCH};

use crate::value::Value;

/// Seconds since the Unix epoch, as a double — the VM's sole native.
pub fn clock(_args: &[Value]) -> Result<Value, String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "system clock is before the epoch".to_string())?;
    Ok(Value::Number(now.as_secs_f64()))
}
