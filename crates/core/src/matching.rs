//! Deterministic text matching used by the catalog lookup tools.
//!
//! Both sides are folded (compatibility decomposition, combining marks
//! removed, lowercase, punctuation collapsed to single spaces) before being
//! compared, so `"Mexico"` matches `"México"` and `"seoul  natl."` matches
//! `"Seoul Natl"`.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

pub const DEFAULT_MATCH_LIMIT: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Prefix,
    Substring,
    TokenOverlap,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Prefix => "prefix",
            Self::Substring => "substring",
            Self::TokenOverlap => "token_overlap",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ranked<T> {
    pub item: T,
    pub kind: MatchKind,
    /// Folded display name used for tie-breaking.
    pub sort_key: String,
}

pub fn fold(value: &str) -> String {
    value
        .nfkd()
        .filter(|ch| !is_combining_mark(*ch))
        .flat_map(char::to_lowercase)
        .map(|ch| if ch.is_alphanumeric() { ch } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Best match kind of a folded query against any of the candidate's names.
pub fn classify(folded_query: &str, candidate_names: &[&str]) -> Option<MatchKind> {
    candidate_names
        .iter()
        .filter_map(|name| classify_one(folded_query, &fold(name)))
        .min()
}

fn classify_one(query: &str, name: &str) -> Option<MatchKind> {
    if query.is_empty() || name.is_empty() {
        return None;
    }
    if name == query {
        return Some(MatchKind::Exact);
    }
    if name.starts_with(query) {
        return Some(MatchKind::Prefix);
    }
    if name.contains(query) {
        return Some(MatchKind::Substring);
    }
    let name_tokens = name.split(' ').collect::<Vec<_>>();
    query
        .split(' ')
        .filter(|token| token.len() >= 2)
        .any(|token| name_tokens.iter().any(|candidate| candidate.starts_with(token)))
        .then_some(MatchKind::TokenOverlap)
}

/// Ranks `items` against `query`.
///
/// An empty or blank query keeps every item, ordered by name. Otherwise only
/// matching items are returned, best kind first, ties broken by folded name
/// and then by original position. At most `limit` items are returned.
pub fn rank<T, F>(query: Option<&str>, items: Vec<T>, names: F, limit: usize) -> Vec<Ranked<T>>
where
    F: Fn(&T) -> Vec<String>,
{
    let folded_query = query.map(fold).unwrap_or_default();

    let mut ranked = items
        .into_iter()
        .enumerate()
        .filter_map(|(position, item)| {
            let candidate_names = names(&item);
            let sort_key = candidate_names.first().map(|name| fold(name)).unwrap_or_default();
            let kind = if folded_query.is_empty() {
                MatchKind::Exact
            } else {
                let borrowed = candidate_names.iter().map(String::as_str).collect::<Vec<_>>();
                classify(&folded_query, &borrowed)?
            };
            Some((position, Ranked { item, kind, sort_key }))
        })
        .collect::<Vec<_>>();

    ranked.sort_by(|(left_pos, left), (right_pos, right)| {
        let by_kind = if folded_query.is_empty() { Ordering::Equal } else { left.kind.cmp(&right.kind) };
        by_kind.then_with(|| left.sort_key.cmp(&right.sort_key)).then(left_pos.cmp(right_pos))
    });
    ranked.truncate(limit);
    ranked.into_iter().map(|(_, ranked)| ranked).collect()
}

#[cfg(test)]
mod tests {
    use super::{classify, fold, rank, MatchKind};

    fn names(value: &&str) -> Vec<String> {
        vec![value.to_string()]
    }

    #[test]
    fn fold_strips_diacritics_case_and_punctuation() {
        assert_eq!(fold("  México, D.F. "), "mexico d f");
        assert_eq!(fold("Université de MONTRÉAL"), "universite de montreal");
        assert_eq!(fold("Ｋｏｒｅａ"), "korea");
    }

    #[test]
    fn classify_orders_kinds() {
        assert_eq!(classify("korea", &["Korea"]), Some(MatchKind::Exact));
        assert_eq!(classify("republic", &["Republic of Korea"]), Some(MatchKind::Prefix));
        assert_eq!(classify("korea", &["Republic of Korea"]), Some(MatchKind::Substring));
        assert_eq!(classify("seoul univ", &["Seoul National University"]), Some(MatchKind::TokenOverlap));
        assert_eq!(classify("brazil", &["Republic of Korea"]), None);
    }

    #[test]
    fn classify_uses_best_of_alternate_names() {
        assert_eq!(
            classify("seoul national university", &["서울대학교", "Seoul National University"]),
            Some(MatchKind::Exact)
        );
    }

    #[test]
    fn rank_puts_better_kinds_first_and_breaks_ties_by_name() {
        let items = vec!["Republic of Korea", "Korea Polytechnic", "Korea", "Canada"];
        let ranked = rank(Some("korea"), items, names, 10);
        let order = ranked.iter().map(|entry| entry.item).collect::<Vec<_>>();
        assert_eq!(order, vec!["Korea", "Korea Polytechnic", "Republic of Korea"]);
        assert_eq!(ranked[1].kind, MatchKind::Prefix);
    }

    #[test]
    fn empty_query_lists_everything_in_name_order() {
        let ranked = rank(Some("   "), vec!["Mexico", "Canada", "Republic of Korea"], names, 2);
        let order = ranked.iter().map(|entry| entry.item).collect::<Vec<_>>();
        assert_eq!(order, vec!["Canada", "Mexico"]);
    }

    #[test]
    fn ranking_is_deterministic() {
        let items = vec!["Universidad de Guadalajara", "Universidad Nacional Autónoma de México"];
        let first = rank(Some("universidad"), items.clone(), names, 10);
        let second = rank(Some("universidad"), items, names, 10);
        assert_eq!(first, second);
    }

    #[test]
    fn no_match_is_an_empty_list() {
        assert!(rank(Some("atlantis"), vec!["Canada"], names, 10).is_empty());
    }
}
