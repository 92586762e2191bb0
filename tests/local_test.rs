mod common;

use common::{create_storage, test_config, DATASET};
use dacp::parser::cache::ParseCache;
use dacp::parser::ParserRegistry;
use dacp::{local, FileFormat, SortOrder};
use serde_json::json;

#[test]
fn test_list_local_storage() {
    let storage = create_storage();
    let config = test_config(storage.path());

    assert_eq!(local::list_datasets(&config).unwrap(), [DATASET]);
    let entries = local::list_dataframes(&config, DATASET).unwrap();
    assert_eq!(entries.len(), 4);
    assert!(entries.iter().all(|e| e.path.starts_with("/ocean/")));
}

#[tokio::test]
async fn test_open_transform_and_write_back() {
    let storage = create_storage();
    let cache = ParseCache::new(storage.path().join(".cache"));
    let registry = ParserRegistry::new(storage.path(), Some(cache));
    let source = storage.path().join(DATASET).join("sample.csv");

    let df = local::open_with(&registry, storage.path(), &source).unwrap();
    let mut top = df
        .filter("d == 4")
        .sort("a", SortOrder::Descending)
        .select(["a", "b"])
        .limit(3);
    assert_eq!(top.column("a").await.unwrap(), [json!(99), json!(94), json!(89)]);

    let output = storage.path().join("out/top.parquet");
    top.write_with(&registry, &output, Some(&source), None)
        .await
        .unwrap();
    let reread = local::open_with(&registry, storage.path(), &output).unwrap();
    assert_eq!(reread.shape().await.unwrap(), (3, 2));

    let json_out = storage.path().join("out/top.data");
    top.write_with(&registry, &json_out, None, Some(FileFormat::Json))
        .await
        .unwrap();
    assert!(json_out.exists());
}

#[tokio::test]
async fn test_sql_over_local_file() {
    let storage = create_storage();
    let registry = ParserRegistry::new(storage.path(), None);
    let source = storage.path().join(DATASET).join("sample.csv");
    let df = local::open_with(&registry, storage.path(), &source).unwrap();

    let grouped = df.sql("SELECT c, COUNT(*) AS n FROM dataframe GROUP BY c ORDER BY c");
    assert_eq!(grouped.column("n").await.unwrap(), [json!(34), json!(33), json!(33)]);
}
