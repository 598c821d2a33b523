//! Intrinsic identifiers.
//!
//! Intrinsics are built-in operations dispatched by enum index rather than
//! callable values. They are part of the resolved-AST contract: the resolver
//! recognizes intrinsic call targets and stamps the call node with an id, and
//! the VM dispatches on the same id. Discriminant values are stable.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum IntrinsicId {
    BitAnd = 0,
    BitOr = 1,
    BitXor = 2,
    BitNot = 3,
    BitShl = 4,
    BitShr = 5,

    ArrayPush = 6,
    ArrayPop = 7,
    ArrayLen = 8,
    ArrayClear = 9,
    ArrayReserve = 10,
    ArrayGet = 11,
    ArraySet = 12,

    MapLen = 13,
    MapGet = 14,
    MapSet = 15,
    MapHas = 16,
    MapRemove = 17,
    MapClear = 18,
    MapIterBegin = 19,
    MapIterNext = 20,
    MapIterEnd = 21,

    StringLen = 22,
    StringSubstr = 23,
    StringCharAt = 24,
    StringFind = 25,
    StringContains = 26,
    StringStartsWith = 27,
    StringEndsWith = 28,
    StringToUpper = 29,
    StringToLower = 30,
    StringTrim = 31,
    StringReplace = 32,
    StringSplit = 33,
    StringJoin = 34,
    StringToInt = 35,
    StringToFloat = 36,
    StringFromCharCode = 37,
    StringConcat = 38,
    StringAppend = 39,
    StringInsert = 40,
    StringReverse = 41,
}

const NAME_TABLE: &[(IntrinsicId, &str)] = &[
    (IntrinsicId::BitAnd, "bit_and"),
    (IntrinsicId::BitOr, "bit_or"),
    (IntrinsicId::BitXor, "bit_xor"),
    (IntrinsicId::BitNot, "bit_not"),
    (IntrinsicId::BitShl, "bit_shl"),
    (IntrinsicId::BitShr, "bit_shr"),
    (IntrinsicId::ArrayPush, "array_push"),
    (IntrinsicId::ArrayPop, "array_pop"),
    (IntrinsicId::ArrayLen, "array_len"),
    (IntrinsicId::ArrayClear, "array_clear"),
    (IntrinsicId::ArrayReserve, "array_reserve"),
    (IntrinsicId::ArrayGet, "array_get"),
    (IntrinsicId::ArraySet, "array_set"),
    (IntrinsicId::MapLen, "map_len"),
    (IntrinsicId::MapGet, "map_get"),
    (IntrinsicId::MapSet, "map_set"),
    (IntrinsicId::MapHas, "map_has"),
    (IntrinsicId::MapRemove, "map_remove"),
    (IntrinsicId::MapClear, "map_clear"),
    (IntrinsicId::MapIterBegin, "map_iter_begin"),
    (IntrinsicId::MapIterNext, "map_iter_next"),
    (IntrinsicId::MapIterEnd, "map_iter_end"),
    (IntrinsicId::StringLen, "string_len"),
    (IntrinsicId::StringSubstr, "string_substr"),
    (IntrinsicId::StringCharAt, "string_char_at"),
    (IntrinsicId::StringFind, "string_find"),
    (IntrinsicId::StringContains, "string_contains"),
    (IntrinsicId::StringStartsWith, "string_starts_with"),
    (IntrinsicId::StringEndsWith, "string_ends_with"),
    (IntrinsicId::StringToUpper, "string_to_upper"),
    (IntrinsicId::StringToLower, "string_to_lower"),
    (IntrinsicId::StringTrim, "string_trim"),
    (IntrinsicId::StringReplace, "string_replace"),
    (IntrinsicId::StringSplit, "string_split"),
    (IntrinsicId::StringJoin, "string_join"),
    (IntrinsicId::StringToInt, "string_to_int"),
    (IntrinsicId::StringToFloat, "string_to_float"),
    (IntrinsicId::StringFromCharCode, "string_from_char_code"),
    (IntrinsicId::StringConcat, "string_concat"),
    (IntrinsicId::StringAppend, "string_append"),
    (IntrinsicId::StringInsert, "string_insert"),
    (IntrinsicId::StringReverse, "string_reverse"),
];

static NAME_INDEX: Lazy<HashMap<&'static str, IntrinsicId>> =
    Lazy::new(|| NAME_TABLE.iter().map(|(id, name)| (*name, *id)).collect());

/// Look up an intrinsic by its surface name.
pub fn intrinsic_id_from_string(name: &str) -> Option<IntrinsicId> {
    NAME_INDEX.get(name).copied()
}

/// The surface name of an intrinsic.
pub fn intrinsic_name(id: IntrinsicId) -> &'static str {
    NAME_TABLE
        .iter()
        .find(|(i, _)| *i == id)
        .map(|(_, n)| *n)
        .unwrap_or("<unknown>")
}

impl IntrinsicId {
    /// Decode a raw discriminant, e.g. from a `CALLINTR` operand.
    pub fn from_raw(raw: u16) -> Option<IntrinsicId> {
        NAME_TABLE
            .iter()
            .find(|(id, _)| *id as u16 == raw)
            .map(|(id, _)| *id)
    }
}
