//! Nested-fragment invalidation, end to end.
//!
//! The Russian-doll pattern: fragments are cached under keys derived from
//! an entity's identity plus its freshness signal. Touching a child bumps
//! every ancestor's signal synchronously, so the next derive yields a new
//! key and the stale fragment is simply never read again. Nothing is
//! deleted; abandoned entries fall to eviction or TTL.

use std::sync::Arc;

use time::OffsetDateTime;
use time::macros::datetime;

use dispensa::{
    Cache, Cacheable, EntityRef, FreshnessSignal, KeyMaterial, MemoryStore, TouchPropagator,
    WriteOptions, derive, derive_stable,
};

const NAMESPACE: &str = "views";

fn cache() -> Cache {
    Cache::new(Arc::new(MemoryStore::new()))
}

/// comment -> article -> site over fixed instances. A comment's id names
/// its article, e.g. `on-a1`.
fn blog() -> TouchPropagator {
    let propagator = TouchPropagator::new();
    propagator
        .declare_edge("comment", "article", |comment| {
            Some(EntityRef::new(
                "article",
                comment.id.trim_start_matches("on-"),
            ))
        })
        .unwrap();
    propagator
        .declare_edge("article", "site", |_| Some(EntityRef::new("site", "main")))
        .unwrap();
    propagator
}

#[tokio::test]
async fn touching_a_comment_abandons_ancestor_fragments() {
    let cache = cache();
    let propagator = blog();
    let tracker = propagator.tracker();

    let article = EntityRef::new("article", "a1");
    let site = EntityRef::new("site", "main");
    tracker.seed(article.clone(), FreshnessSignal::Version(3));
    tracker.seed(site.clone(), FreshnessSignal::Version(9));

    // Render both fragments under their derived keys.
    let article_key = derive(NAMESPACE, &tracker.tracked(article.clone()), None);
    let site_key = derive(NAMESPACE, &tracker.tracked(site.clone()), None);
    assert_eq!(article_key.as_str(), "views/article/a1-3");
    assert_eq!(site_key.as_str(), "views/site/main-9");

    cache.write(&article_key, &"article-v1").await.unwrap();
    cache.write(&site_key, &"site-v1").await.unwrap();

    // A comment lands on the article.
    propagator.touch(
        &EntityRef::new("comment", "on-a1"),
        OffsetDateTime::now_utc(),
    );

    // Both ancestors now derive new, disjoint keys.
    let article_key_after = derive(NAMESPACE, &tracker.tracked(article.clone()), None);
    let site_key_after = derive(NAMESPACE, &tracker.tracked(site.clone()), None);
    assert_eq!(article_key_after.as_str(), "views/article/a1-4");
    assert_eq!(site_key_after.as_str(), "views/site/main-10");

    // New keys miss, prompting a re-render.
    assert_eq!(cache.read::<String>(&article_key_after).await.unwrap(), None);
    assert_eq!(cache.read::<String>(&site_key_after).await.unwrap(), None);

    let rebuilt: String = cache
        .fetch(&article_key_after, || async { Ok("article-v2".to_owned()) })
        .await
        .unwrap();
    assert_eq!(rebuilt, "article-v2");

    // The old fragments were abandoned, not deleted.
    assert_eq!(
        cache.read::<String>(&article_key).await.unwrap().as_deref(),
        Some("article-v1")
    );
    assert_eq!(
        cache.read::<String>(&site_key).await.unwrap().as_deref(),
        Some("site-v1")
    );
}

#[tokio::test]
async fn untouched_siblings_keep_their_fragments() {
    let cache = cache();
    let propagator = blog();
    let tracker = propagator.tracker();

    let touched = EntityRef::new("article", "a1");
    let sibling = EntityRef::new("article", "a2");
    tracker.seed(touched.clone(), FreshnessSignal::Version(1));
    tracker.seed(sibling.clone(), FreshnessSignal::Version(1));

    let sibling_key = derive(NAMESPACE, &tracker.tracked(sibling.clone()), None);
    cache.write(&sibling_key, &"sibling").await.unwrap();

    propagator.touch(&EntityRef::new("comment", "on-a1"), OffsetDateTime::now_utc());

    // The sibling's signal and key are untouched; its fragment still hits.
    let sibling_key_after = derive(NAMESPACE, &tracker.tracked(sibling), None);
    assert_eq!(sibling_key, sibling_key_after);
    assert_eq!(
        cache.read::<String>(&sibling_key_after).await.unwrap().as_deref(),
        Some("sibling")
    );
}

// ============================================================================
// Entities that carry their own signal
// ============================================================================

/// A domain type implementing the contract directly, no ledger involved.
struct Article {
    id: &'static str,
    updated_at: OffsetDateTime,
}

impl Cacheable for Article {
    fn cache_prefix(&self) -> &'static str {
        "article"
    }

    fn cache_id(&self) -> String {
        self.id.to_owned()
    }

    fn freshness(&self) -> FreshnessSignal {
        FreshnessSignal::Timestamp(self.updated_at)
    }
}

#[tokio::test]
async fn entity_mutation_changes_the_derived_key() {
    let cache = cache();
    let mut article = Article {
        id: "intro",
        updated_at: datetime!(2024-03-01 12:00:00 UTC),
    };
    let locale = KeyMaterial::map([("locale", KeyMaterial::str("en"))]);

    let before = derive(NAMESPACE, &article, Some(&locale));
    cache.write(&before, &"rendered-en").await.unwrap();
    assert_eq!(
        cache.read::<String>(&before).await.unwrap().as_deref(),
        Some("rendered-en")
    );

    // An edit advances the timestamp; the same derive call now names a
    // different key.
    article.updated_at += time::Duration::minutes(5);
    let after = derive(NAMESPACE, &article, Some(&locale));
    assert_ne!(before, after);
    assert_eq!(cache.read::<String>(&after).await.unwrap(), None);

    // The extra material partitions keys too.
    let meta = KeyMaterial::map([("locale", KeyMaterial::str("de"))]);
    assert_ne!(derive(NAMESPACE, &article, Some(&meta)), after);
}

#[tokio::test]
async fn stable_keys_recycle_through_version_tags() {
    let cache = cache();
    let article = Article {
        id: "intro",
        updated_at: datetime!(2024-03-01 12:00:00 UTC),
    };

    // One key per entity; the freshness token rides along as the entry's
    // version tag instead.
    let stable = derive_stable(NAMESPACE, &article, None);
    assert_eq!(stable.as_str(), "views/article/intro");

    let version = article.freshness().token();
    cache
        .write_with(
            &stable,
            &"rendered-old",
            &WriteOptions::default().with_version(&version),
        )
        .await
        .unwrap();

    // Reading with the stored version hits.
    assert_eq!(
        cache
            .read_versioned::<String>(&stable, Some(version.as_str()))
            .await
            .unwrap()
            .as_deref(),
        Some("rendered-old")
    );

    // After a mutation the same key reads as a miss under the new version,
    // and the next write recycles the slot.
    let bumped = article.freshness().bumped(article.updated_at + time::Duration::minutes(5));
    let new_version = bumped.token();
    assert_eq!(
        cache
            .read_versioned::<String>(&stable, Some(new_version.as_str()))
            .await
            .unwrap(),
        None
    );

    cache
        .write_with(
            &stable,
            &"rendered-new",
            &WriteOptions::default().with_version(&new_version),
        )
        .await
        .unwrap();
    assert_eq!(
        cache
            .read_versioned::<String>(&stable, Some(new_version.as_str()))
            .await
            .unwrap()
            .as_deref(),
        Some("rendered-new")
    );
}
