//! Smoke test against a running mongod.
//! Run with: MONGODB_URI=mongodb://localhost:27017 cargo test --test mongo_store -- --ignored

use bson::doc;
use chain_mirror::db::{Entity, LogicalDb, MirrorStore, MongoClient};

#[tokio::test]
#[ignore] // requires a live MongoDB deployment
async fn count_tracks_deletes_exactly() {
    let uri = std::env::var("MONGODB_URI").expect("MONGODB_URI required");
    let suffix = chrono::Utc::now().timestamp_millis();
    let store = MongoClient::new(
        &uri,
        &format!("mirror_count_{}", suffix),
        &format!("mirror_count_images_{}", suffix),
    )
    .await
    .expect("Failed to connect");

    for id in 1..=5_i64 {
        store
            .insert_one(LogicalDb::General, Entity::PostText, doc! { "_id": id })
            .await
            .unwrap();
    }
    store
        .delete_many(
            LogicalDb::General,
            Entity::PostText,
            doc! { "_id": { "$in": [2_i64, 4_i64] } },
        )
        .await
        .unwrap();

    let total = store
        .count(LogicalDb::General, Entity::PostText, doc! {})
        .await
        .unwrap();
    assert_eq!(total, 3);

    store
        .delete_many(LogicalDb::General, Entity::PostText, doc! {})
        .await
        .unwrap();
    let empty = store
        .count(LogicalDb::General, Entity::PostText, doc! {})
        .await
        .unwrap();
    assert_eq!(empty, 0);
}
