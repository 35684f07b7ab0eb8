use proptest::prelude::*;

/// Bot, condition, channel and user names as they arrive from chat platforms,
/// including empty and whitespace-only ones
pub fn identifier_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => "[A-Za-z][A-Za-z0-9_-]{0,23}",
        1 => Just(String::new()),
        1 => " {1,3}",
    ]
}

/// Counter entries as read from a hash, names unique
pub fn counts_strategy() -> impl Strategy<Value = Vec<(String, u64)>> {
    prop::collection::btree_map("[a-z]{1,8}", 0u64..50, 0..20)
        .prop_map(|map| map.into_iter().collect())
}

/// Sequences of call outcomes, `true` for success
pub fn outcomes_strategy() -> impl Strategy<Value = Vec<bool>> {
    prop::collection::vec(prop::bool::weighted(0.6), 0..40)
}
