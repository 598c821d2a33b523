//! `CALLINTR` dispatch.
//!
//! Each intrinsic validates its argument count and types, does its work, and
//! writes the result to the destination register. Arguments sit in the
//! registers directly above the destination. The map-iterator `next` is the
//! one intrinsic with a wide result: it writes (valid, key, value) into a
//! three-register window starting at the destination.

use smalls_parser::ast::IntrinsicId;

use crate::runtime::types::TypeKind;
use crate::runtime::value::{Value, ValueRepr};
use crate::runtime::Runtime;

use super::VirtualMachine;

impl VirtualMachine {
    pub(crate) fn call_intrinsic(
        &mut self,
        rt: &mut Runtime,
        id: IntrinsicId,
        dest_reg: u8,
        argc: u8,
    ) {
        use IntrinsicId::*;
        match id {
            BitNot => {
                let Some(v) = self.intrinsic_int_arg(rt, dest_reg, argc, 1, 0, "bit_not") else {
                    return;
                };
                self.set_reg(dest_reg, rt.make_int(!v));
            }
            BitAnd | BitOr | BitXor | BitShl | BitShr => {
                let Some(lhs) = self.intrinsic_int_arg(rt, dest_reg, argc, 2, 0, "bit op") else {
                    return;
                };
                let Some(rhs) = self.intrinsic_int_arg(rt, dest_reg, argc, 2, 1, "bit op") else {
                    return;
                };
                let result = match id {
                    BitAnd => lhs & rhs,
                    BitOr => lhs | rhs,
                    BitXor => lhs ^ rhs,
                    BitShl => lhs.wrapping_shl(rhs as u32),
                    _ => lhs.wrapping_shr(rhs as u32),
                };
                self.set_reg(dest_reg, rt.make_int(result));
            }

            ArrayPush | ArrayPop | ArrayLen | ArrayClear | ArrayReserve | ArrayGet | ArraySet => {
                self.array_intrinsic(rt, id, dest_reg, argc);
            }

            MapLen | MapGet | MapSet | MapHas | MapRemove | MapClear | MapIterBegin
            | MapIterNext | MapIterEnd => {
                self.map_intrinsic(rt, id, dest_reg, argc);
            }

            _ => self.string_intrinsic(rt, id, dest_reg, argc),
        }
    }

    fn intrinsic_int_arg(
        &mut self,
        rt: &Runtime,
        dest_reg: u8,
        argc: u8,
        expected: u8,
        index: u8,
        name: &str,
    ) -> Option<i32> {
        if argc != expected {
            self.fail(rt, format!("{} expects {} arguments", name, expected));
            return None;
        }
        let val = self.reg(dest_reg + 1 + index);
        match val.as_int() {
            Some(v) => Some(v),
            None => {
                self.fail(rt, "Intrinsic arguments must be int");
                None
            }
        }
    }

    fn expect_argc(&mut self, rt: &Runtime, argc: u8, expected: u8, name: &str) -> bool {
        if argc != expected {
            self.fail(rt, format!("{} expects {} arguments", name, expected));
            return false;
        }
        true
    }

    fn array_arg(
        &mut self,
        rt: &Runtime,
        reg_idx: u8,
    ) -> Option<crate::runtime::value::HeapPtr> {
        let val = self.reg(reg_idx);
        let is_array = matches!(
            rt.get_type(val.type_id).map(|t| &t.kind),
            Some(TypeKind::Array { .. })
        );
        if !is_array {
            self.fail(rt, "Intrinsic expects array");
            return None;
        }
        match val.heap_ptr() {
            Some(ptr) if !ptr.is_null() => Some(ptr),
            _ => {
                self.fail(rt, "Intrinsic expects array");
                None
            }
        }
    }

    fn array_intrinsic(&mut self, rt: &mut Runtime, id: IntrinsicId, dest_reg: u8, argc: u8) {
        use IntrinsicId::*;
        match id {
            ArrayPush => {
                if !self.expect_argc(rt, argc, 2, "array_push") {
                    return;
                }
                let Some(ptr) = self.array_arg(rt, dest_reg + 1) else {
                    return;
                };
                let val = self.reg(dest_reg + 2);
                if let Some(arr) = rt.heap.get_array_mut(ptr) {
                    arr.push(val);
                }
                self.set_reg(dest_reg, Value::default());
            }
            ArrayPop => {
                if !self.expect_argc(rt, argc, 1, "array_pop") {
                    return;
                }
                let Some(ptr) = self.array_arg(rt, dest_reg + 1) else {
                    return;
                };
                match rt.heap.get_array_mut(ptr).and_then(Vec::pop) {
                    Some(val) => self.set_reg(dest_reg, val),
                    None => self.fail(rt, "Cannot pop from empty array"),
                }
            }
            ArrayLen => {
                if !self.expect_argc(rt, argc, 1, "array_len") {
                    return;
                }
                let Some(ptr) = self.array_arg(rt, dest_reg + 1) else {
                    return;
                };
                let len = rt.heap.get_array(ptr).map(Vec::len).unwrap_or(0);
                self.set_reg(dest_reg, rt.make_int(len as i32));
            }
            ArrayClear => {
                if !self.expect_argc(rt, argc, 1, "array_clear") {
                    return;
                }
                let Some(ptr) = self.array_arg(rt, dest_reg + 1) else {
                    return;
                };
                if let Some(arr) = rt.heap.get_array_mut(ptr) {
                    arr.clear();
                }
                self.set_reg(dest_reg, Value::default());
            }
            ArrayReserve => {
                if !self.expect_argc(rt, argc, 2, "array_reserve") {
                    return;
                }
                let Some(ptr) = self.array_arg(rt, dest_reg + 1) else {
                    return;
                };
                let Some(extra) = self.reg(dest_reg + 2).as_int() else {
                    self.fail(rt, "Intrinsic arguments must be int");
                    return;
                };
                if let Some(arr) = rt.heap.get_array_mut(ptr) {
                    arr.reserve(extra.max(0) as usize);
                }
                self.set_reg(dest_reg, Value::default());
            }
            ArrayGet => {
                if !self.expect_argc(rt, argc, 2, "array_get") {
                    return;
                }
                let Some(ptr) = self.array_arg(rt, dest_reg + 1) else {
                    return;
                };
                let Some(index) = self.reg(dest_reg + 2).as_int() else {
                    self.fail(rt, "Intrinsic arguments must be int");
                    return;
                };
                match rt.array_get(ptr, index.max(0) as u32).filter(|_| index >= 0) {
                    Some(val) => self.set_reg(dest_reg, val),
                    None => self.fail(rt, "Array index out of bounds"),
                }
            }
            ArraySet => {
                if !self.expect_argc(rt, argc, 3, "array_set") {
                    return;
                }
                let Some(ptr) = self.array_arg(rt, dest_reg + 1) else {
                    return;
                };
                let Some(index) = self.reg(dest_reg + 2).as_int() else {
                    self.fail(rt, "Intrinsic arguments must be int");
                    return;
                };
                let val = self.reg(dest_reg + 3);
                if index < 0 || !rt.array_set(ptr, index as u32, val) {
                    self.fail(rt, "Array index out of bounds");
                    return;
                }
                self.set_reg(dest_reg, Value::default());
            }
            _ => unreachable!("array intrinsic dispatch"),
        }
    }

    fn map_arg(&mut self, rt: &Runtime, reg_idx: u8) -> Option<crate::runtime::value::HeapPtr> {
        let val = self.reg(reg_idx);
        let is_map = matches!(
            rt.get_type(val.type_id).map(|t| &t.kind),
            Some(TypeKind::Map { .. })
        );
        if !is_map {
            self.fail(rt, "Intrinsic expects map");
            return None;
        }
        match val.heap_ptr() {
            Some(ptr) if !ptr.is_null() => Some(ptr),
            _ => {
                self.fail(rt, "Intrinsic expects map");
                None
            }
        }
    }

    fn map_intrinsic(&mut self, rt: &mut Runtime, id: IntrinsicId, dest_reg: u8, argc: u8) {
        use IntrinsicId::*;
        match id {
            MapLen => {
                if !self.expect_argc(rt, argc, 1, "map_len") {
                    return;
                }
                let Some(ptr) = self.map_arg(rt, dest_reg + 1) else {
                    return;
                };
                let len = rt.heap.get_map(ptr).map(|m| m.entries.len()).unwrap_or(0);
                self.set_reg(dest_reg, rt.make_int(len as i32));
            }
            MapGet => {
                if !self.expect_argc(rt, argc, 2, "map_get") {
                    return;
                }
                let Some(ptr) = self.map_arg(rt, dest_reg + 1) else {
                    return;
                };
                let key = self.reg(dest_reg + 2);
                match rt.map_get(ptr, key) {
                    Ok(Some(val)) => self.set_reg(dest_reg, val),
                    Ok(None) => self.set_reg(dest_reg, Value::default()),
                    Err(err) => self.fail(rt, err),
                }
            }
            MapSet => {
                if !self.expect_argc(rt, argc, 3, "map_set") {
                    return;
                }
                let Some(ptr) = self.map_arg(rt, dest_reg + 1) else {
                    return;
                };
                let key = self.reg(dest_reg + 2);
                let val = self.reg(dest_reg + 3);
                if let Err(err) = rt.map_set(ptr, key, val) {
                    self.fail(rt, err);
                    return;
                }
                self.set_reg(dest_reg, Value::default());
            }
            MapHas => {
                if !self.expect_argc(rt, argc, 2, "map_has") {
                    return;
                }
                let Some(ptr) = self.map_arg(rt, dest_reg + 1) else {
                    return;
                };
                let key = self.reg(dest_reg + 2);
                match rt.map_get(ptr, key) {
                    Ok(found) => self.set_reg(dest_reg, rt.make_bool(found.is_some())),
                    Err(err) => self.fail(rt, err),
                }
            }
            MapRemove => {
                if !self.expect_argc(rt, argc, 2, "map_remove") {
                    return;
                }
                let Some(ptr) = self.map_arg(rt, dest_reg + 1) else {
                    return;
                };
                let key = self.reg(dest_reg + 2);
                let map_key = match rt.map_key_from_value(key) {
                    Ok(k) => k,
                    Err(err) => {
                        self.fail(rt, err);
                        return;
                    }
                };
                let removed = rt
                    .heap
                    .get_map_mut(ptr)
                    .map(|m| m.entries.remove(&map_key).is_some())
                    .unwrap_or(false);
                self.set_reg(dest_reg, rt.make_bool(removed));
            }
            MapClear => {
                if !self.expect_argc(rt, argc, 1, "map_clear") {
                    return;
                }
                let Some(ptr) = self.map_arg(rt, dest_reg + 1) else {
                    return;
                };
                if let Some(map) = rt.heap.get_map_mut(ptr) {
                    map.entries.clear();
                }
                self.set_reg(dest_reg, Value::default());
            }
            MapIterBegin => {
                if !self.expect_argc(rt, argc, 1, "map_iter_begin") {
                    return;
                }
                let Some(ptr) = self.map_arg(rt, dest_reg + 1) else {
                    return;
                };
                match rt.map_iter_begin(ptr) {
                    Ok(handle) => self.set_reg(dest_reg, rt.make_int(handle)),
                    Err(err) => self.fail(rt, err),
                }
            }
            MapIterNext => {
                if !self.expect_argc(rt, argc, 1, "map_iter_next") {
                    return;
                }
                let Some(handle) = self.reg(dest_reg + 1).as_int() else {
                    self.fail(rt, "Intrinsic arguments must be int");
                    return;
                };
                match rt.map_iter_next(handle) {
                    Ok(Some((key, value))) => {
                        self.set_reg(dest_reg, rt.make_bool(true));
                        self.set_reg(dest_reg + 1, key);
                        self.set_reg(dest_reg + 2, value);
                    }
                    Ok(None) => {
                        self.set_reg(dest_reg, rt.make_bool(false));
                        self.set_reg(dest_reg + 1, Value::default());
                        self.set_reg(dest_reg + 2, Value::default());
                    }
                    Err(err) => self.fail(rt, err),
                }
            }
            MapIterEnd => {
                if !self.expect_argc(rt, argc, 2, "map_iter_end") {
                    return;
                }
                let Some(handle) = self.reg(dest_reg + 2).as_int() else {
                    self.fail(rt, "Intrinsic arguments must be int");
                    return;
                };
                rt.map_iter_end(handle);
                self.set_reg(dest_reg, Value::default());
            }
            _ => unreachable!("map intrinsic dispatch"),
        }
    }

    fn string_arg(&mut self, rt: &Runtime, reg_idx: u8, context: &str) -> Option<String> {
        let val = self.reg(reg_idx);
        if val.type_id != rt.string_type() {
            self.fail(rt, format!("{} expects string argument", context));
            return None;
        }
        match val.repr {
            ValueRepr::Heap(ptr) => Some(rt.get_string_view(ptr).to_string()),
            _ => {
                self.fail(rt, format!("{} expects string argument", context));
                None
            }
        }
    }

    fn string_intrinsic(&mut self, rt: &mut Runtime, id: IntrinsicId, dest_reg: u8, argc: u8) {
        use IntrinsicId::*;
        match id {
            StringLen => {
                if !self.expect_argc(rt, argc, 1, "string_len") {
                    return;
                }
                let Some(s) = self.string_arg(rt, dest_reg + 1, "string_len") else {
                    return;
                };
                self.set_reg(dest_reg, rt.make_int(s.chars().count() as i32));
            }
            StringSubstr => {
                if !self.expect_argc(rt, argc, 3, "string_substr") {
                    return;
                }
                let Some(s) = self.string_arg(rt, dest_reg + 1, "string_substr") else {
                    return;
                };
                let (Some(start), Some(len)) = (
                    self.reg(dest_reg + 2).as_int(),
                    self.reg(dest_reg + 3).as_int(),
                ) else {
                    self.fail(rt, "string_substr expects int offsets");
                    return;
                };
                let chars: Vec<char> = s.chars().collect();
                let start = start.max(0) as usize;
                let len = len.max(0) as usize;
                let sub: String = chars.iter().skip(start).take(len).collect();
                let result = rt.make_string(&sub);
                self.set_reg(dest_reg, result);
            }
            StringCharAt => {
                if !self.expect_argc(rt, argc, 2, "string_char_at") {
                    return;
                }
                let Some(s) = self.string_arg(rt, dest_reg + 1, "string_char_at") else {
                    return;
                };
                let Some(index) = self.reg(dest_reg + 2).as_int() else {
                    self.fail(rt, "string_char_at expects int index");
                    return;
                };
                match s.chars().nth(index.max(0) as usize).filter(|_| index >= 0) {
                    Some(ch) => {
                        let result = rt.make_string(&ch.to_string());
                        self.set_reg(dest_reg, result);
                    }
                    None => self.fail(rt, "String index out of bounds"),
                }
            }
            StringFind => {
                if !self.expect_argc(rt, argc, 2, "string_find") {
                    return;
                }
                let Some(haystack) = self.string_arg(rt, dest_reg + 1, "string_find") else {
                    return;
                };
                let Some(needle) = self.string_arg(rt, dest_reg + 2, "string_find") else {
                    return;
                };
                let found = haystack
                    .find(&needle)
                    .map(|byte_idx| haystack[..byte_idx].chars().count() as i32)
                    .unwrap_or(-1);
                self.set_reg(dest_reg, rt.make_int(found));
            }
            StringContains => {
                if !self.expect_argc(rt, argc, 2, "string_contains") {
                    return;
                }
                let Some(haystack) = self.string_arg(rt, dest_reg + 1, "string_contains") else {
                    return;
                };
                let Some(needle) = self.string_arg(rt, dest_reg + 2, "string_contains") else {
                    return;
                };
                self.set_reg(dest_reg, rt.make_bool(haystack.contains(&needle)));
            }
            StringStartsWith => {
                if !self.expect_argc(rt, argc, 2, "string_starts_with") {
                    return;
                }
                let Some(s) = self.string_arg(rt, dest_reg + 1, "string_starts_with") else {
                    return;
                };
                let Some(prefix) = self.string_arg(rt, dest_reg + 2, "string_starts_with") else {
                    return;
                };
                self.set_reg(dest_reg, rt.make_bool(s.starts_with(&prefix)));
            }
            StringEndsWith => {
                if !self.expect_argc(rt, argc, 2, "string_ends_with") {
                    return;
                }
                let Some(s) = self.string_arg(rt, dest_reg + 1, "string_ends_with") else {
                    return;
                };
                let Some(suffix) = self.string_arg(rt, dest_reg + 2, "string_ends_with") else {
                    return;
                };
                self.set_reg(dest_reg, rt.make_bool(s.ends_with(&suffix)));
            }
            StringToUpper | StringToLower | StringTrim | StringReverse => {
                if !self.expect_argc(rt, argc, 1, "string op") {
                    return;
                }
                let Some(s) = self.string_arg(rt, dest_reg + 1, "string op") else {
                    return;
                };
                let out = match id {
                    StringToUpper => s.to_uppercase(),
                    StringToLower => s.to_lowercase(),
                    StringTrim => s.trim().to_string(),
                    _ => s.chars().rev().collect(),
                };
                let result = rt.make_string(&out);
                self.set_reg(dest_reg, result);
            }
            StringReplace => {
                if !self.expect_argc(rt, argc, 3, "string_replace") {
                    return;
                }
                let Some(s) = self.string_arg(rt, dest_reg + 1, "string_replace") else {
                    return;
                };
                let Some(from) = self.string_arg(rt, dest_reg + 2, "string_replace") else {
                    return;
                };
                let Some(to) = self.string_arg(rt, dest_reg + 3, "string_replace") else {
                    return;
                };
                let out = if from.is_empty() { s } else { s.replace(&from, &to) };
                let result = rt.make_string(&out);
                self.set_reg(dest_reg, result);
            }
            StringSplit => {
                if !self.expect_argc(rt, argc, 2, "string_split") {
                    return;
                }
                let Some(s) = self.string_arg(rt, dest_reg + 1, "string_split") else {
                    return;
                };
                let Some(sep) = self.string_arg(rt, dest_reg + 2, "string_split") else {
                    return;
                };
                let parts: Vec<String> = if sep.is_empty() {
                    s.chars().map(|c| c.to_string()).collect()
                } else {
                    s.split(&sep).map(str::to_string).collect()
                };
                let string_tid = rt.string_type();
                let array_tid = rt.types.register_array_type(string_tid);
                let Some(ptr) = rt.alloc_array(array_tid, 0) else {
                    self.fail(rt, "Failed to allocate array");
                    return;
                };
                for part in parts {
                    let elem = rt.make_string(&part);
                    if let Some(arr) = rt.heap.get_array_mut(ptr) {
                        arr.push(elem);
                    }
                }
                self.set_reg(dest_reg, Value::make_heap(ptr, array_tid));
            }
            StringJoin => {
                if !self.expect_argc(rt, argc, 2, "string_join") {
                    return;
                }
                let Some(ptr) = self.array_arg(rt, dest_reg + 1) else {
                    return;
                };
                let Some(sep) = self.string_arg(rt, dest_reg + 2, "string_join") else {
                    return;
                };
                let Some(elems) = rt.heap.get_array(ptr).cloned() else {
                    self.fail(rt, "string_join expects array");
                    return;
                };
                let mut parts = Vec::with_capacity(elems.len());
                for elem in elems {
                    match elem.repr {
                        ValueRepr::Heap(p) if elem.type_id == rt.string_type() => {
                            parts.push(rt.get_string_view(p).to_string());
                        }
                        _ => {
                            self.fail(rt, "string_join expects an array of strings");
                            return;
                        }
                    }
                }
                let joined = parts.join(&sep);
                let result = rt.make_string(&joined);
                self.set_reg(dest_reg, result);
            }
            StringToInt => {
                if !self.expect_argc(rt, argc, 1, "string_to_int") {
                    return;
                }
                let Some(s) = self.string_arg(rt, dest_reg + 1, "string_to_int") else {
                    return;
                };
                match s.trim().parse::<i32>() {
                    Ok(v) => self.set_reg(dest_reg, rt.make_int(v)),
                    Err(_) => self.fail(rt, format!("Cannot convert '{}' to int", s)),
                }
            }
            StringToFloat => {
                if !self.expect_argc(rt, argc, 1, "string_to_float") {
                    return;
                }
                let Some(s) = self.string_arg(rt, dest_reg + 1, "string_to_float") else {
                    return;
                };
                match s.trim().parse::<f32>() {
                    Ok(v) => self.set_reg(dest_reg, rt.make_float(v)),
                    Err(_) => self.fail(rt, format!("Cannot convert '{}' to float", s)),
                }
            }
            StringFromCharCode => {
                if !self.expect_argc(rt, argc, 1, "string_from_char_code") {
                    return;
                }
                let Some(code) = self.reg(dest_reg + 1).as_int() else {
                    self.fail(rt, "string_from_char_code expects int");
                    return;
                };
                match u32::try_from(code).ok().and_then(char::from_u32) {
                    Some(ch) => {
                        let result = rt.make_string(&ch.to_string());
                        self.set_reg(dest_reg, result);
                    }
                    None => self.fail(rt, "Invalid character code"),
                }
            }
            StringConcat => {
                let mut out = String::new();
                for i in 0..argc {
                    let val = self.reg(dest_reg + 1 + i);
                    match val.repr {
                        ValueRepr::Heap(p) if val.type_id == rt.string_type() => {
                            out.push_str(rt.get_string_view(p));
                        }
                        ValueRepr::Int(v) => out.push_str(&v.to_string()),
                        ValueRepr::Float(v) => out.push_str(&format!("{}", v)),
                        ValueRepr::Bool(v) => out.push_str(&v.to_string()),
                        _ => {
                            self.fail(rt, "string_concat expects printable arguments");
                            return;
                        }
                    }
                }
                let result = rt.make_string(&out);
                self.set_reg(dest_reg, result);
            }
            StringAppend => {
                if !self.expect_argc(rt, argc, 2, "string_append") {
                    return;
                }
                let Some(base) = self.string_arg(rt, dest_reg + 1, "string_append") else {
                    return;
                };
                let Some(tail) = self.string_arg(rt, dest_reg + 2, "string_append") else {
                    return;
                };
                let result = rt.make_string(&format!("{}{}", base, tail));
                self.set_reg(dest_reg, result);
            }
            StringInsert => {
                if !self.expect_argc(rt, argc, 3, "string_insert") {
                    return;
                }
                let Some(base) = self.string_arg(rt, dest_reg + 1, "string_insert") else {
                    return;
                };
                let Some(at) = self.reg(dest_reg + 2).as_int() else {
                    self.fail(rt, "string_insert expects int index");
                    return;
                };
                let Some(insert) = self.string_arg(rt, dest_reg + 3, "string_insert") else {
                    return;
                };
                let chars: Vec<char> = base.chars().collect();
                if at < 0 || at as usize > chars.len() {
                    self.fail(rt, "String index out of bounds");
                    return;
                }
                let mut out: String = chars[..at as usize].iter().collect();
                out.push_str(&insert);
                out.extend(&chars[at as usize..]);
                let result = rt.make_string(&out);
                self.set_reg(dest_reg, result);
            }
            _ => self.fail(rt, format!("Unimplemented intrinsic: {:?}", id)),
        }
    }
}
