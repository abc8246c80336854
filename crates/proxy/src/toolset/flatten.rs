//! Reversible name flattening for peers that cannot accept the namespace
//! separator in tool names.
//!
//! The transform replaces the separator with a configured delimiter and
//! resolves collisions with a numeric suffix. The exposed→namespaced map is
//! rebuilt on every exposure; nothing about it is persisted.

use std::collections::{HashMap, HashSet};

/// Compute exposed names for `namespaced` names, in input order.
///
/// With no delimiter configured the transform is the identity. Returns
/// `(exposed, namespaced)` pairs.
#[must_use]
pub fn flatten_names(
    namespaced: &[String],
    separator: &str,
    delimiter: Option<&str>,
) -> Vec<(String, String)> {
    let mut used: HashSet<String> = HashSet::with_capacity(namespaced.len());
    let mut out = Vec::with_capacity(namespaced.len());

    for name in namespaced {
        let base = match delimiter {
            Some(d) => name.replace(separator, d),
            None => name.clone(),
        };

        let mut exposed = base.clone();
        let mut suffix = 0usize;
        while !used.insert(exposed.clone()) {
            suffix += 1;
            exposed = format!("{base}_{suffix}");
        }
        out.push((exposed, name.clone()));
    }
    out
}

/// Build the exposed→namespaced lookup from [`flatten_names`] output.
#[must_use]
pub fn name_map(pairs: &[(String, String)]) -> HashMap<String, String> {
    pairs.iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn identity_without_delimiter() {
        let pairs = flatten_names(&names(&["srv.echo", "db.query"]), ".", None);
        assert_eq!(
            pairs,
            vec![
                ("srv.echo".to_string(), "srv.echo".to_string()),
                ("db.query".to_string(), "db.query".to_string()),
            ]
        );
    }

    #[test]
    fn replaces_every_separator_occurrence() {
        let pairs = flatten_names(&names(&["srv.sub.echo"]), ".", Some("_"));
        assert_eq!(pairs[0].0, "srv_sub_echo");
        assert_eq!(pairs[0].1, "srv.sub.echo");
    }

    #[test]
    fn collisions_get_numeric_suffixes() {
        // Both flatten to a_b_c; the second gets a suffix.
        let pairs = flatten_names(&names(&["a.b_c", "a_b.c"]), ".", Some("_"));
        assert_eq!(pairs[0].0, "a_b_c");
        assert_eq!(pairs[1].0, "a_b_c_1");

        let map = name_map(&pairs);
        assert_eq!(map["a_b_c"], "a.b_c");
        assert_eq!(map["a_b_c_1"], "a_b.c");
    }

    #[test]
    fn suffix_skips_names_already_taken() {
        let pairs = flatten_names(&names(&["x.y", "x_y", "x_y_1"]), ".", Some("_"));
        let exposed: Vec<&str> = pairs.iter().map(|(e, _)| e.as_str()).collect();
        assert_eq!(exposed, vec!["x_y", "x_y_1", "x_y_1_1"]);

        // Round trip stays unambiguous.
        let map = name_map(&pairs);
        assert_eq!(map.len(), 3);
    }
}
