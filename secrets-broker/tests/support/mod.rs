#![allow(dead_code)]

pub mod auth;
pub mod store;

use std::collections::HashMap;

/// Lookup function over a fixed set of variables, for `BrokerConfig::from_lookup`.
pub fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    move |key| map.get(key).cloned()
}
