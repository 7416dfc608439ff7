//! Host functions exposed to scripts as globals.

use crate::error::ErrorKind;
use crate::value::Value;
use crate::vm::Vm;

/// Registers every native. Called once while the VM is being built.
pub fn install(vm: &mut Vm) {
    vm.define_native("clock", 0, clock);
}

/// Seconds since the VM started, as a double.
fn clock(vm: &mut Vm, _args: &[Value]) -> Result<Value, ErrorKind> {
    Ok(Value::Double(vm.uptime_seconds()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let mut vm = Vm::new();
        let first = match clock(&mut vm, &[]) {
            Ok(Value::Double(d)) => d,
            other => panic!("unexpected clock result: {:?}", other),
        };
        let second = match clock(&mut vm, &[]) {
            Ok(Value::Double(d)) => d,
            other => panic!("unexpected clock result: {:?}", other),
        };
        assert!(second >= first);
        assert!(first >= 0.0);
    }
}
