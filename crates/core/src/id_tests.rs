// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::session::SessionId;
use std::borrow::Borrow;
use std::collections::HashMap;

#[test]
fn generated_ids_carry_prefix_and_fill_the_buffer() {
    let id = SessionId::generate();
    assert!(id.as_str().starts_with("ses-"));
    assert_eq!(id.as_str().len(), ID_LEN);
}

#[test]
fn generated_ids_are_unique() {
    let a = ExecutionId::generate();
    let b = ExecutionId::generate();
    assert_ne!(a, b);
}

#[test]
fn from_string_round_trips() {
    let id = WorkspaceId::from_string("wks-alpha");
    assert_eq!(id.as_str(), "wks-alpha");
    assert_eq!(id, "wks-alpha");
}

#[test]
fn short_strips_prefix_and_truncates() {
    let id = SubscriberId::from_string("sub-0123456789");
    assert_eq!(id.short(4), "0123");
    assert_eq!(id.short(99), "0123456789");
}

#[test]
fn idbuf_hash_matches_str_hash_for_map_lookup() {
    let mut map: HashMap<SessionId, u32> = HashMap::new();
    let id = SessionId::from_string("ses-lookup");
    map.insert(id, 7);
    assert_eq!(map.get("ses-lookup"), Some(&7));
}

#[test]
fn idbuf_borrow_returns_active_bytes_only() {
    let buf = IdBuf::new("abc");
    let s: &str = buf.borrow();
    assert_eq!(s, "abc");
    assert_eq!(s.len(), 3);
}

#[test]
fn serde_is_transparent() {
    let id = PrincipalId::from_string("usr-carol");
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"usr-carol\"");
    let back: PrincipalId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}

#[test]
fn deserialize_rejects_oversized_ids() {
    let long = format!("\"{}\"", "x".repeat(ID_LEN + 1));
    let result: Result<ContainerId, _> = serde_json::from_str(&long);
    assert!(result.is_err());
}

#[test]
fn short_helper_is_safe_on_small_strings() {
    assert_eq!(short("ab", 5), "ab");
    assert_eq!(short("abcdef", 3), "abc");
}
