//! Relationship enricher: one batched lookup per fact type, never one per item.

use std::hash::Hash;

use conduit_core::{ArticleId, Datastore, Enriched, FeedResult, Relational, RelationshipFacts, UserId, ViewerContext};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};

/// Merge viewer-relative facts into `rows`, keeping their order.
///
/// Favorite counts are always fetched. Favorited/following lookups only run for
/// a known viewer; an anonymous viewer gets false for both. Missing ids in a
/// batch result mean "no row", i.e. false/zero. Any datastore failure aborts
/// the whole batch.
pub fn enrich<D, T>(store: &D, rows: Vec<T>, viewer: &ViewerContext) -> FeedResult<Vec<Enriched<T>>>
where
    D: Datastore + ?Sized,
    T: Relational,
{
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let targets: Vec<ArticleId> = distinct(rows.iter().filter_map(|r| r.favorite_target()));

    let counts: FxHashMap<ArticleId, u64> = if targets.is_empty() {
        FxHashMap::default()
    } else {
        counter!("feed_enrich_batches_total", 1u64, "fact" => "favorite_count");
        store.favorite_counts(&targets)?
    };

    let (favorited, followed) = match viewer.id() {
        None => (FxHashSet::default(), FxHashSet::default()),
        Some(me) => {
            let favorited = if targets.is_empty() {
                FxHashSet::default()
            } else {
                counter!("feed_enrich_batches_total", 1u64, "fact" => "favorited");
                store.favorited_by(me, &targets)?
            };
            let authors: Vec<UserId> = distinct(rows.iter().map(|r| r.author_id()));
            counter!("feed_enrich_batches_total", 1u64, "fact" => "following");
            (favorited, store.followed_among(me, &authors)?)
        }
    };

    Ok(rows
        .into_iter()
        .map(|item| {
            let facts = match item.favorite_target() {
                Some(id) => RelationshipFacts {
                    is_favorited_by_viewer: favorited.contains(id),
                    favorite_count: counts.get(id).copied().unwrap_or(0),
                    is_author_followed_by_viewer: followed.contains(item.author_id()),
                },
                None => RelationshipFacts { is_author_followed_by_viewer: followed.contains(item.author_id()), ..Default::default() },
            };
            Enriched { item, facts }
        })
        .collect())
}

fn distinct<'a, K>(keys: impl Iterator<Item = &'a K>) -> Vec<K>
where
    K: Clone + Eq + Hash + 'a,
{
    let mut seen: FxHashSet<&K> = FxHashSet::default();
    keys.filter(|k| seen.insert(*k)).cloned().collect()
}
