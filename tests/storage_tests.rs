use leafscan_node::error::StoreError;
use leafscan_node::inference::Label;
use leafscan_node::protocol::SubmitterId;
use leafscan_node::storage::{PredictionStore, SledStore};
use tempfile::TempDir;

fn create_test_store() -> (SledStore, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let store = SledStore::open(temp_dir.path().join("sled_db")).unwrap();
    (store, temp_dir)
}

#[tokio::test]
async fn test_image_ids_increase() {
    let (store, _dir) = create_test_store();
    let submitter = SubmitterId::Number(1);

    let first = store.create_image("uploads/1/a.jpg", &submitter).await.unwrap();
    let second = store.create_image("uploads/1/b.jpg", &submitter).await.unwrap();

    assert!(first.id >= 1);
    assert!(second.id > first.id);
    assert_eq!(second.storage_path, "uploads/1/b.jpg");
    assert_eq!(second.submitter_id, submitter);
}

#[tokio::test]
async fn test_create_user_is_idempotent() {
    let (store, _dir) = create_test_store();
    let submitter = SubmitterId::Text("maria".to_string());

    store.create_user(&submitter).await.unwrap();
    store.create_user(&submitter).await.unwrap();
}

#[tokio::test]
async fn test_empty_history() {
    let (store, _dir) = create_test_store();
    let history = store.list_predictions(&SubmitterId::Number(404)).await.unwrap();
    assert!(history.is_empty());
}

#[tokio::test]
async fn test_history_in_storage_order_and_idempotent() {
    let (store, _dir) = create_test_store();
    let submitter = SubmitterId::Number(5);
    let other = SubmitterId::Number(6);

    let a = store.create_image("a.jpg", &submitter).await.unwrap();
    let b = store.create_image("b.jpg", &submitter).await.unwrap();
    let c = store.create_image("c.jpg", &other).await.unwrap();

    // saved out of order; history follows image ids
    store.save_prediction(b.id, Label::Diseased, 80.0).await.unwrap();
    store.save_prediction(a.id, Label::Healthy, 40.0).await.unwrap();
    store.save_prediction(c.id, Label::PossibleDisease, 60.0).await.unwrap();

    let first = store.list_predictions(&submitter).await.unwrap();
    let ids: Vec<u64> = first.iter().map(|p| p.image_id).collect();
    assert_eq!(ids, vec![a.id, b.id]);
    assert_eq!(first[0].result, Label::Healthy);
    assert_eq!(first[1].confidence, 80.0);

    let second = store.list_predictions(&submitter).await.unwrap();
    assert_eq!(first, second);

    let others = store.list_predictions(&other).await.unwrap();
    assert_eq!(others.len(), 1);
    assert_eq!(others[0].image_id, c.id);
}

#[tokio::test]
async fn test_save_prediction_for_unknown_image() {
    let (store, _dir) = create_test_store();
    let err = store.save_prediction(999, Label::Healthy, 20.0).await.unwrap_err();
    assert!(matches!(err, StoreError::ImageNotFound(999)));
}

#[tokio::test]
async fn test_repeated_save_overwrites() {
    let (store, _dir) = create_test_store();
    let submitter = SubmitterId::Number(9);
    let image = store.create_image("leaf.jpg", &submitter).await.unwrap();

    store.save_prediction(image.id, Label::Healthy, 40.0).await.unwrap();
    store.save_prediction(image.id, Label::Diseased, 60.0).await.unwrap();

    let history = store.list_predictions(&submitter).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].result, Label::Diseased);
    assert_eq!(history[0].confidence, 60.0);
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("sled_db");
    let submitter = SubmitterId::Number(12);

    let image_id = {
        let store = SledStore::open(&path).unwrap();
        let image = store.create_image("leaf.jpg", &submitter).await.unwrap();
        store.save_prediction(image.id, Label::PossibleDisease, 60.0).await.unwrap();
        store.flush().await.unwrap();
        image.id
    };

    let store = SledStore::open(&path).unwrap();
    let history = store.list_predictions(&submitter).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].image_id, image_id);
    assert!(store.get_image(image_id).await.unwrap().is_some());
}
