use std::sync::Arc;

use tritontube_core::{
    CoordStore, DeleteMetadataRequest, ListMetadataRequest, MetadataItem, MetadataService,
    MetadataServiceConfig, PutMetadataRequest, RelationalPool, RelationalStore, TritonError,
};

fn new_service() -> (Arc<MetadataService>, Arc<CoordStore>) {
    let store = Arc::new(RelationalStore::new());
    let coord = Arc::new(CoordStore::new());
    let config = MetadataServiceConfig::new(RelationalPool::new(store), coord.clone());
    (Arc::new(MetadataService::new(config)), coord)
}

fn item(key: &str, value: &str) -> MetadataItem {
    MetadataItem {
        key: key.to_string(),
        value: value.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_put_get_lifecycle() {
    let (svc, _coord) = new_service();

    let ingest = r#"{"status":"ingesting"}"#;
    let put = svc
        .put_metadata(PutMetadataRequest {
            item: item("video/1", ingest),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(put.item.version, 1);

    let got = svc.get_metadata("video/1").await.unwrap();
    assert_eq!(got.value, ingest);
    assert_eq!(got.version, 1);

    let ready = r#"{"status":"ready"}"#;
    let updated = svc
        .put_metadata(PutMetadataRequest {
            item: item("video/1", ready),
            expected_version: Some(put.item.version),
            expected_revision: Some(put.revision),
        })
        .await
        .unwrap();
    assert_eq!(updated.item.version, 2);

    svc.delete_metadata(DeleteMetadataRequest {
        key: "video/1".to_string(),
        expected_version: Some(updated.item.version),
        expected_revision: Some(updated.revision),
    })
    .await
    .unwrap();

    assert!(matches!(
        svc.get_metadata("video/1").await.unwrap_err(),
        TritonError::NotFound(_)
    ));
}

#[tokio::test]
async fn test_versions_are_gap_free() {
    let (svc, _coord) = new_service();
    for expected in 1..=6 {
        let resp = svc
            .put_metadata(PutMetadataRequest {
                item: item("video/7", "{}"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(resp.item.version, expected);
    }
}

#[tokio::test]
async fn test_mirror_tracks_relational_version() {
    let (svc, coord) = new_service();
    svc.put_metadata(PutMetadataRequest {
        item: item("video/9", r#"{"status":"ingesting"}"#),
        ..Default::default()
    })
    .await
    .unwrap();

    let mirrored = coord.get("metadata/video/9").await.unwrap();
    let decoded: MetadataItem = serde_json::from_str(&mirrored.kvs[0].value).unwrap();
    assert_eq!(decoded.version, 1);
    assert_eq!(decoded.key, "video/9");
}

#[tokio::test]
async fn test_expected_version_on_missing_key() {
    let (svc, _coord) = new_service();
    let err = svc
        .put_metadata(PutMetadataRequest {
            item: item("video/ghost", "{}"),
            expected_version: Some(1),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TritonError::NotFound(_)));
}

#[tokio::test]
async fn test_stale_expected_version_is_rejected() {
    let (svc, _coord) = new_service();
    let first = svc
        .put_metadata(PutMetadataRequest {
            item: item("video/7", "{}"),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(first.item.version, 1);

    let winner = svc
        .put_metadata(PutMetadataRequest {
            item: item("video/7", r#"{"status":"ready"}"#),
            expected_version: Some(1),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(winner.item.version, 2);

    let err = svc
        .put_metadata(PutMetadataRequest {
            item: item("video/7", r#"{"status":"stale"}"#),
            expected_version: Some(1),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TritonError::VersionMismatch { actual: 2, .. }));
}

#[tokio::test]
async fn test_concurrent_cas_has_one_winner() {
    let (svc, _coord) = new_service();
    svc.put_metadata(PutMetadataRequest {
        item: item("video/7", "{}"),
        ..Default::default()
    })
    .await
    .unwrap();

    let a = {
        let svc = svc.clone();
        tokio::spawn(async move {
            svc.put_metadata(PutMetadataRequest {
                item: item("video/7", r#"{"writer":"a"}"#),
                expected_version: Some(1),
                ..Default::default()
            })
            .await
        })
    };
    let b = {
        let svc = svc.clone();
        tokio::spawn(async move {
            svc.put_metadata(PutMetadataRequest {
                item: item("video/7", r#"{"writer":"b"}"#),
                expected_version: Some(1),
                ..Default::default()
            })
            .await
        })
    };

    let results = [a.await.unwrap(), b.await.unwrap()];
    let winners = results.iter().filter(|result| result.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = results
        .iter()
        .find_map(|result| result.as_ref().err())
        .expect("one writer must lose");
    assert!(matches!(loser, TritonError::VersionMismatch { .. }));
}

#[tokio::test]
async fn test_revision_conflict_on_external_mirror_write() {
    let (svc, coord) = new_service();
    let put = svc
        .put_metadata(PutMetadataRequest {
            item: item("video/5", "{}"),
            ..Default::default()
        })
        .await
        .unwrap();

    // Another process bumps the mirror behind our back.
    coord.put("metadata/video/5", "{}").await.unwrap();

    let err = svc
        .put_metadata(PutMetadataRequest {
            item: item("video/5", r#"{"status":"ready"}"#),
            expected_version: Some(put.item.version),
            expected_revision: Some(put.revision),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TritonError::RevisionConflict(_)));
}

#[tokio::test]
async fn test_delete_missing_key() {
    let (svc, _coord) = new_service();
    let err = svc
        .delete_metadata(DeleteMetadataRequest {
            key: "video/ghost".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, TritonError::NotFound(_)));
}

#[tokio::test]
async fn test_list_pagination() {
    let (svc, _coord) = new_service();
    for i in 0..5 {
        svc.put_metadata(PutMetadataRequest {
            item: item(&format!("video/{}", i), "{}"),
            ..Default::default()
        })
        .await
        .unwrap();
    }
    // An unrelated prefix must not leak into the listing.
    svc.put_metadata(PutMetadataRequest {
        item: item("segment/x/720p/0", "{}"),
        ..Default::default()
    })
    .await
    .unwrap();

    let first = svc
        .list_metadata(ListMetadataRequest {
            prefix: "video/".to_string(),
            limit: 2,
            page_token: String::new(),
        })
        .await
        .unwrap();
    let keys: Vec<_> = first.items.iter().map(|item| item.key.as_str()).collect();
    assert_eq!(keys, vec!["video/0", "video/1"]);
    assert_eq!(first.next_page_token, "video/1");

    let second = svc
        .list_metadata(ListMetadataRequest {
            prefix: "video/".to_string(),
            limit: 4,
            page_token: first.next_page_token,
        })
        .await
        .unwrap();
    let keys: Vec<_> = second.items.iter().map(|item| item.key.as_str()).collect();
    assert_eq!(keys, vec!["video/2", "video/3", "video/4"]);
    assert!(second.next_page_token.is_empty());
}

#[tokio::test]
async fn test_list_sees_every_item_exactly_once() {
    let (svc, _coord) = new_service();
    for i in 0..9 {
        svc.put_metadata(PutMetadataRequest {
            item: item(&format!("video/{:02}", i), "{}"),
            ..Default::default()
        })
        .await
        .unwrap();
    }

    let mut seen = Vec::new();
    let mut token = String::new();
    loop {
        let page = svc
            .list_metadata(ListMetadataRequest {
                prefix: "video/".to_string(),
                limit: 4,
                page_token: token.clone(),
            })
            .await
            .unwrap();
        seen.extend(page.items.iter().map(|item| item.key.clone()));
        if page.next_page_token.is_empty() {
            break;
        }
        token = page.next_page_token;
    }

    let expected: Vec<_> = (0..9).map(|i| format!("video/{:02}", i)).collect();
    assert_eq!(seen, expected);
}
