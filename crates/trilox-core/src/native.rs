//! Native function ABI
//!
//! Stands in for the dynamic-library-loaded native host described in
//! spec §6: each native is `{ name, return_tag, fn }`, with the VM wrapping
//! the raw return per `return_tag` into a `Value`. Real `dlopen`-based
//! loading is out of scope (spec §1); natives here are registered
//! in-process at VM construction instead of resolved from a shared object.

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use crate::object::ReturnTag;
use crate::value::Value;

/// Raw return payload a native hands back to the VM, tagged so the VM
/// knows how to box it into a `Value` (matching §6's `num`/`nil`/`string`
/// return tags).
pub enum NativeReturn {
    Nil,
    Number(f64),
    String(String),
}

pub type NativeFn = fn(args: &[Value]) -> Result<NativeReturn, String>;

/// Where `disp` (and any future print-like native) writes. Defaults to
/// stdout; tests swap in an in-memory buffer to assert on output, the same
/// pattern the teacher's VM uses for `set_output_writer`.
pub type OutputWriter = Rc<RefCell<dyn Write>>;

pub fn stdout_writer() -> OutputWriter {
    Rc::new(RefCell::new(std::io::stdout()))
}

pub fn clock(args: &[Value]) -> Result<NativeReturn, String> {
    if !args.is_empty() {
        return Err("clock() takes no arguments".to_string());
    }
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Ok(NativeReturn::Number(since_epoch.as_secs_f64()))
}

/// A native binding ready to install as a global: its ABI-visible name,
/// the tag the VM uses to box its return value, and the function pointer.
pub struct NativeBinding {
    pub name: &'static str,
    pub return_tag: ReturnTag,
    pub func: NativeFn,
}

/// The built-in natives every VM registers, standing in for what a real
/// native-library host would `loadLibrary` in.
pub fn builtins() -> Vec<NativeBinding> {
    vec![
        NativeBinding {
            name: "disp",
            return_tag: ReturnTag::Nil,
            func: disp_and_write as NativeFn,
        },
        NativeBinding {
            name: "clock",
            return_tag: ReturnTag::Number,
            func: clock,
        },
    ]
}

thread_local! {
    static WRITER: RefCell<Option<OutputWriter>> = const { RefCell::new(None) };
}

/// `disp`'s actual body writes through the VM's configured output writer;
/// it is installed via `set_disp_writer` by the VM at construction time so
/// the plain `NativeFn` signature (no VM handle) still reaches stdout or a
/// test buffer as appropriate.
pub fn set_disp_writer(writer: OutputWriter) {
    WRITER.with(|w| *w.borrow_mut() = Some(writer));
}

fn disp_and_write(args: &[Value]) -> Result<NativeReturn, String> {
    if args.len() != 1 {
        return Err("disp() takes exactly one argument".to_string());
    }
    let text = format!("{}\n", args[0]);
    WRITER.with(|w| {
        if let Some(writer) = w.borrow().as_ref() {
            let _ = writer.borrow_mut().write_all(text.as_bytes());
        } else {
            print!("{text}");
        }
    });
    Ok(NativeReturn::Nil)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disp_writes_through_configured_writer() {
        let buf: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        set_disp_writer(buf.clone());
        disp_and_write(&[Value::Number(3.0)]).unwrap();
        let written = buf.borrow();
        assert_eq!(&**written, b"3\n");
    }

    #[test]
    fn clock_rejects_arguments() {
        assert!(clock(&[Value::Nil]).is_err());
    }
}
