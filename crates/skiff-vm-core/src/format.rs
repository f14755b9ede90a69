//! Value stringification
//!
//! Used by string concatenation, `print` and diagnostics. Numbers print in
//! shortest-round-trip form, with integral doubles rendered without a
//! fractional part; booleans as `true`/`false`; null as `null`.

use crate::heap::{Heap, ObjRef};
use crate::object::ObjData;
use crate::value::Value;

/// Render a number the way scripts observe it.
pub fn display_number(n: f64) -> String {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 9.007_199_254_740_992e15 {
        let mut buf = itoa::Buffer::new();
        buf.format(n as i64).to_string()
    } else {
        let mut buf = ryu::Buffer::new();
        buf.format(n).to_string()
    }
}

/// Render a value for concatenation / printing.
pub fn display_value(heap: &Heap, value: Value) -> String {
    if value.is_number() {
        display_number(value.as_number())
    } else if value.is_bool() {
        if value.is_true() { "true".to_string() } else { "false".to_string() }
    } else if value.is_null() {
        "null".to_string()
    } else {
        let r = value.as_obj().expect("value category");
        display_obj(heap, r)
    }
}

fn display_obj(heap: &Heap, r: ObjRef) -> String {
    match heap.data(r) {
        ObjData::String(s) => s.text.clone(),
        ObjData::Module(m) => format!("<module {}>", m.name),
        ObjData::Class(c) => format!("<class {}>", c.name),
        ObjData::Instance(i) => format!("<instance {}>", heap.class(i.class).name),
        ObjData::Function(f) => format!("<fn {}>", f.name),
        ObjData::NativeFn(_) => "<native fn>".to_string(),
        ObjData::Reference(x) => match x.class {
            Some(c) => format!("<reference {}>", heap.class(c).name),
            None => "<reference>".to_string(),
        },
        ObjData::WeakRef(w) => format!("<weak ref {:#x}>", w.data),
    }
}

/// Render a value's type for error messages.
pub fn type_name(heap: &Heap, value: Value) -> String {
    if value.is_number() {
        "<Number>".to_string()
    } else if value.is_bool() {
        "<Boolean>".to_string()
    } else if value.is_null() {
        "<Nil>".to_string()
    } else {
        let r = value.as_obj().expect("value category");
        format!("<{}>", heap.kind(r).name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjString;

    #[test]
    fn test_display_number_integral() {
        assert_eq!(display_number(3.0), "3");
        assert_eq!(display_number(-12.0), "-12");
        assert_eq!(display_number(0.0), "0");
    }

    #[test]
    fn test_display_number_fractional() {
        assert_eq!(display_number(1.5), "1.5");
        assert_eq!(display_number(-0.25), "-0.25");
    }

    #[test]
    fn test_display_singletons() {
        let heap = Heap::new(1024, 4096, 0.5);
        assert_eq!(display_value(&heap, Value::TRUE), "true");
        assert_eq!(display_value(&heap, Value::FALSE), "false");
        assert_eq!(display_value(&heap, Value::NULL), "null");
    }

    #[test]
    fn test_display_string_is_raw_text() {
        let mut heap = Heap::new(1024, 4096, 0.5);
        let s = heap.insert(ObjData::String(ObjString::new("hi".into())));
        assert_eq!(display_value(&heap, Value::from_obj(s)), "hi");
        assert_eq!(type_name(&heap, Value::from_obj(s)), "<String>");
    }
}
