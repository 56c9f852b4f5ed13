//! A full backup run against a mock cache server and an in-process fake
//! S3 endpoint.

use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Bytes;
use axum::extract::Path as UrlPath;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::put;
use cachefleet_backup::{BackupRunner, S3Credentials, S3Store};
use cachefleet_core::Instance;
use cachefleet_core::config::BackupConfig;
use cachefleet_redis::RedisConf;
use cachefleet_redis::testing::MockRedis;
use cachefleet_supervisor::Layout;

type Objects = Arc<Mutex<Vec<(String, usize, bool)>>>;

async fn fake_s3() -> (String, Objects) {
    let objects: Objects = Arc::default();
    let log = objects.clone();
    let router = Router::new()
        .route("/{bucket}", put(|| async { StatusCode::CONFLICT }))
        .route(
            "/{bucket}/{*key}",
            put(
                move |UrlPath((bucket, key)): UrlPath<(String, String)>,
                      headers: HeaderMap,
                      body: Bytes| {
                    let log = log.clone();
                    async move {
                        let signed = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .is_some_and(|v| v.starts_with("AWS4-HMAC-SHA256 "));
                        log.lock()
                            .unwrap()
                            .push((format!("{bucket}/{key}"), body.len(), signed));
                        StatusCode::OK
                    }
                },
            ),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (endpoint, objects)
}

#[tokio::test]
async fn uploads_snapshot_and_removes_staging_and_lock() {
    const SIZE: usize = 10_000;

    let data = tempfile::tempdir().unwrap();
    let staging = tempfile::tempdir().unwrap();
    let layout = Layout::new(data.path(), data.path());

    let redis = MockRedis::start("pw").await;
    layout
        .write_record(&Instance::new("inst-A", "127.0.0.1", redis.port(), "pw"))
        .unwrap();
    let paths = layout.paths("inst-A").unwrap();
    let mut conf = RedisConf::new();
    conf.set("port", redis.port().to_string());
    conf.set("requirepass", "pw");
    conf.set("dir", paths.db_dir().display().to_string());
    conf.save(&paths.config()).unwrap();
    redis.set_dump(&paths.db_dir().join("dump.rdb"), &vec![3u8; SIZE]);

    let (endpoint, objects) = fake_s3().await;
    let config = BackupConfig {
        enabled: true,
        bucket_name: "cache-backups".into(),
        endpoint_url: endpoint.clone(),
        region: "us-east-1".into(),
        access_key: "access".into(),
        secret_key: "secret".into(),
        path_prefix: "/nightly/".into(),
        bg_save_timeout_seconds: 5,
        redis_data_directory: data.path().to_path_buf(),
        node_id: "node-0".into(),
        staging_directory: staging.path().to_path_buf(),
        broker: None,
    };
    let store = S3Store::new(
        &endpoint,
        S3Credentials {
            access_key: "access".into(),
            secret_key: "secret".into(),
            region: "us-east-1".into(),
        },
    )
    .unwrap();

    let report = BackupRunner::new(config, Arc::new(store)).run().await.unwrap();
    assert!(report.is_success(), "{:?}", report.failed);

    let objects = objects.lock().unwrap();
    assert_eq!(objects.len(), 1);
    let (key, size, signed) = &objects[0];
    assert!(key.starts_with("cache-backups/nightly/node-0/inst-A/"), "{key}");
    assert!(key.ends_with("-redis-backup"));
    assert_eq!(*size, SIZE);
    assert!(signed);

    assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    assert!(!paths.lock().exists());
}
