use std::io::Cursor;
use std::time::Duration;

use jiff::Timestamp;
use rfs_core::{
    BoxReader, Error, is_retryable_error, Fs, HashType, Object, OpenOption, PacerConfig, RootKind, SizeSuffix,
    StaticObjectInfo,
};
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{body_json, body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;

const SHA1: &str = "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed";

fn options(server: &MockServer) -> BoxOptions {
    options_for(&server.uri())
}

fn options_for(uri: &str) -> BoxOptions {
    let mut options = BoxOptions::new("test-token");
    options.root_url = uri.to_string();
    options.upload_url = format!("{uri}/upload");
    options.upload_cutoff = SizeSuffix(16);
    options.list_chunk = 2;
    options.pacer = PacerConfig {
        min_sleep: Duration::from_millis(1),
        max_sleep: Duration::from_millis(10),
        decay_constant: 2,
        retries: 3,
    };
    options
}

async fn connect(server: &MockServer, root: &str) -> BoxFs {
    BoxFs::new_unchecked("box", root, options(server))
        .await
        .unwrap()
        .0
}

fn file(id: &str, name: &str, size: u64) -> Value {
    json!({
        "type": "file",
        "id": id,
        "name": name,
        "size": size,
        "sha1": SHA1,
        "modified_at": "2024-01-02T03:04:05Z",
        "content_modified_at": "2024-01-02T03:04:05Z",
        "item_status": "active"
    })
}

fn folder(id: &str, name: &str) -> Value {
    json!({
        "type": "folder",
        "id": id,
        "name": name,
        "modified_at": "2024-01-02T03:04:05Z",
        "item_status": "active"
    })
}

fn page(entries: Vec<Value>, total: u64, offset: u64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "total_count": total,
        "entries": entries,
        "offset": offset,
        "limit": 2
    }))
}

fn uploaded(item: Value) -> ResponseTemplate {
    ResponseTemplate::new(201).set_body_json(json!({
        "total_count": 1,
        "entries": [item]
    }))
}

async fn mount_listing(server: &MockServer, dir_id: &str, entries: Vec<Value>) {
    let total = entries.len() as u64;
    Mock::given(method("GET"))
        .and(path(format!("/folders/{dir_id}/items")))
        .respond_with(page(entries, total, 0))
        .mount(server)
        .await;
}

fn reader(data: &[u8]) -> BoxReader {
    Box::pin(Cursor::new(data.to_vec()))
}

fn info(remote: &str, size: usize) -> StaticObjectInfo {
    StaticObjectInfo::new(
        remote,
        Some(size as u64),
        "2024-05-06T07:08:09Z".parse::<Timestamp>().unwrap(),
    )
}

#[tokio::test]
async fn list_follows_pages_and_skips_unusable_items() {
    let server = MockServer::start().await;
    let mut trashed = file("2", "gone.txt", 1);
    trashed["item_status"] = json!("trashed");

    Mock::given(method("GET"))
        .and(path("/folders/0/items"))
        .and(header("authorization", "Bearer test-token"))
        .and(query_param("offset", "0"))
        .and(query_param("limit", "2"))
        .respond_with(page(vec![folder("10", "docs"), trashed], 5, 0))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/folders/0/items"))
        .and(query_param("offset", "2"))
        .respond_with(page(
            vec![
                file("3", "a.txt", 5),
                json!({"type": "web_link", "id": "4", "name": "link"}),
            ],
            5,
            2,
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/folders/0/items"))
        .and(query_param("offset", "4"))
        .respond_with(page(vec![file("5", "b\u{FF3C}c.txt", 7)], 5, 4))
        .expect(1)
        .mount(&server)
        .await;

    let fs = connect(&server, "").await;
    let entries = fs.list("").await.unwrap();

    let names: Vec<&str> = entries.iter().map(|e| e.remote()).collect();
    assert_eq!(names, vec!["docs", "a.txt", r"b\c.txt"]);
    assert!(entries[0].is_dir());
    assert_eq!(fs.dir_cache().get("docs"), Some("10".to_string()));
}

#[tokio::test]
async fn lookup_stops_listing_at_first_match() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/folders/0/items"))
        .and(query_param("offset", "0"))
        .respond_with(page(vec![folder("10", "docs"), folder("11", "misc")], 10, 0))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/folders/0/items"))
        .and(query_param("offset", "2"))
        .respond_with(page(vec![], 10, 2))
        .expect(0)
        .mount(&server)
        .await;
    mount_listing(&server, "10", vec![file("20", "x.txt", 42)]).await;

    let fs = connect(&server, "").await;
    let object = fs.new_object("docs/x.txt").await.unwrap();

    assert_eq!(object.size().await.unwrap(), 42);
    assert_eq!(object.hash(HashType::Sha1).await.unwrap().as_deref(), Some(SHA1));
    assert_eq!(
        object.mod_time().await.unwrap(),
        "2024-01-02T03:04:05Z".parse::<Timestamp>().unwrap()
    );
}

#[tokio::test]
async fn missing_object_is_object_not_found() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![file("1", "other.txt", 1)]).await;

    let fs = connect(&server, "").await;
    let err = fs.new_object("nope.txt").await.unwrap_err();
    assert!(err.is_object_not_found());

    // A missing parent directory reads the same way
    let err = fs.new_object("no/such/file.txt").await.unwrap_err();
    assert!(err.is_object_not_found());
}

#[tokio::test]
async fn md5_is_unsupported() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![file("9", "a.txt", 3)]).await;

    let fs = connect(&server, "").await;
    let object = fs.new_object("a.txt").await.unwrap();
    let err = object.hash(HashType::Md5).await.unwrap_err();
    assert!(matches!(err, Error::HashUnsupported));
}

#[tokio::test]
async fn small_put_is_a_single_request() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![]).await;
    Mock::given(method("POST"))
        .and(path("/upload/files/content"))
        .and(body_string_contains("a\u{FF3C}b.txt"))
        .and(body_string_contains("hello"))
        .respond_with(uploaded(file("77", "a\u{FF3C}b.txt", 5)))
        .expect(1)
        .mount(&server)
        .await;

    let fs = connect(&server, "").await;
    let object = fs.put(reader(b"hello"), &info(r"a\b.txt", 5)).await.unwrap();

    assert_eq!(object.remote(), r"a\b.txt");
    assert_eq!(object.size().await.unwrap(), 5);
    assert_eq!(fs.upload_tokens().acquisitions(), 0);
}

#[tokio::test]
async fn put_over_existing_file_uploads_new_version() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![file("55", "a.txt", 3)]).await;
    Mock::given(method("POST"))
        .and(path("/upload/files/55/content"))
        .respond_with(uploaded(file("55", "a.txt", 4)))
        .expect(1)
        .mount(&server)
        .await;

    let fs = connect(&server, "").await;
    let object = fs.put(reader(b"abcd"), &info("a.txt", 4)).await.unwrap();
    assert_eq!(object.size().await.unwrap(), 4);
}

#[tokio::test]
async fn chunked_upload_holds_one_token() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![]).await;
    Mock::given(method("POST"))
        .and(path("/upload/files/upload_sessions"))
        .and(body_json(json!({"folder_id": "0", "file_size": 20, "file_name": "big.bin"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "sess",
            "part_size": 8,
            "total_parts": 3,
            "num_parts_processed": 0
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/files/upload_sessions/sess"))
        .and(header("content-range", "bytes 16-19/20"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "part": {"part_id": "p3", "offset": 16, "size": 4, "sha1": "x"}
        })))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/files/upload_sessions/sess"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "part": {"part_id": "p", "offset": 0, "size": 8, "sha1": "x"}
        })))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload/files/upload_sessions/sess/commit"))
        .respond_with(ResponseTemplate::new(202).insert_header("retry-after", "0"))
        .with_priority(1)
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/upload/files/upload_sessions/sess/commit"))
        .respond_with(uploaded(file("88", "big.bin", 20)))
        .expect(1)
        .mount(&server)
        .await;

    let fs = connect(&server, "").await;
    let data = [7u8; 20];
    let object = fs.put(reader(&data), &info("big.bin", data.len())).await.unwrap();

    assert_eq!(object.size().await.unwrap(), 20);
    assert_eq!(fs.upload_tokens().acquisitions(), 1);
    assert_eq!(fs.upload_tokens().in_use(), 0);
}

#[tokio::test]
async fn failed_chunked_upload_aborts_session_and_releases_token() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![]).await;
    Mock::given(method("POST"))
        .and(path("/upload/files/upload_sessions"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "sess",
            "part_size": 8,
            "total_parts": 3
        })))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/upload/files/upload_sessions/sess"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "type": "error",
            "status": 400,
            "code": "range_mismatch",
            "message": "bad range"
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/upload/files/upload_sessions/sess"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let fs = connect(&server, "").await;
    let data = [1u8; 20];
    let err = fs
        .put(reader(&data), &info("big.bin", data.len()))
        .await
        .unwrap_err();

    assert_eq!(err.http().map(|h| h.status), Some(400));
    assert_eq!(fs.upload_tokens().acquisitions(), 1);
    assert_eq!(fs.upload_tokens().in_use(), 0);
}

#[tokio::test]
async fn mkdir_creates_missing_folders() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![]).await;
    mount_listing(&server, "50", vec![]).await;
    Mock::given(method("POST"))
        .and(path("/folders"))
        .and(body_json(json!({"name": "a", "parent": {"id": "0"}})))
        .respond_with(ResponseTemplate::new(201).set_body_json(folder("50", "a")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/folders"))
        .and(body_json(json!({"name": "b", "parent": {"id": "50"}})))
        .respond_with(ResponseTemplate::new(201).set_body_json(folder("51", "b")))
        .expect(1)
        .mount(&server)
        .await;

    let fs = connect(&server, "").await;
    fs.mkdir("a/b").await.unwrap();
    assert_eq!(fs.dir_cache().get("a/b"), Some("51".to_string()));
}

#[tokio::test]
async fn copy_refuses_names_equal_ignoring_case() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![file("7", "A.txt", 3)]).await;
    Mock::given(method("POST"))
        .and(path("/files/7/copy"))
        .and(body_json(json!({"name": "b.txt", "parent": {"id": "0"}})))
        .respond_with(ResponseTemplate::new(201).set_body_json(file("8", "b.txt", 3)))
        .expect(1)
        .mount(&server)
        .await;

    let fs = connect(&server, "").await;
    let src = fs.new_object("A.txt").await.unwrap();

    let err = fs.copy(&*src, "a.txt").await.unwrap_err();
    assert!(err.to_string().contains("same name when lowercase"));

    let copied = fs.copy(&*src, "b.txt").await.unwrap();
    assert_eq!(copied.remote(), "b.txt");
}

#[tokio::test]
async fn copy_from_another_remote_is_refused() {
    let server = MockServer::start().await;
    let fs = connect(&server, "").await;
    let (other, _) = BoxFs::new_unchecked("other", "", options(&server))
        .await
        .unwrap();
    let item: crate::api::Item = serde_json::from_value(file("7", "a.txt", 3)).unwrap();
    let src = BoxObject::from_item(other, "a.txt", &item).unwrap();

    assert!(matches!(fs.copy(&src, "b.txt").await, Err(Error::CantCopy)));
    assert!(matches!(fs.move_object(&src, "b.txt").await, Err(Error::CantMove)));
}

#[tokio::test]
async fn move_renames_file() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![file("7", "a.txt", 3)]).await;
    Mock::given(method("PUT"))
        .and(path("/files/7"))
        .and(body_json(json!({"name": "c.txt", "parent": {"id": "0"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(file("7", "c.txt", 3)))
        .expect(1)
        .mount(&server)
        .await;

    let fs = connect(&server, "").await;
    let src = fs.new_object("a.txt").await.unwrap();
    let moved = fs.move_object(&*src, "c.txt").await.unwrap();
    assert_eq!(moved.remote(), "c.txt");
}

#[tokio::test]
async fn dir_move_refuses_root() {
    let server = MockServer::start().await;
    let fs = connect(&server, "").await;
    let err = fs.dir_move(&fs, "", "x").await.unwrap_err();
    assert!(err.to_string().contains("can't move root"));
}

#[tokio::test]
async fn dir_move_onto_existing_directory_is_dir_exists() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![folder("20", "src"), folder("21", "dst")]).await;

    let fs = connect(&server, "").await;
    let err = fs.dir_move(&fs, "src", "dst").await.unwrap_err();
    assert!(matches!(err, Error::DirExists));
}

#[tokio::test]
async fn dir_move_reparents_folder_and_flushes_cache() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![folder("20", "src")]).await;
    Mock::given(method("PUT"))
        .and(path("/folders/20"))
        .and(body_json(json!({"name": "dst", "parent": {"id": "0"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(folder("20", "dst")))
        .expect(1)
        .mount(&server)
        .await;

    let fs = connect(&server, "").await;
    fs.dir_move(&fs, "src", "dst").await.unwrap();
    assert_eq!(fs.dir_cache().get("src"), None);
}

#[tokio::test]
async fn purge_refuses_root() {
    let server = MockServer::start().await;
    let fs = connect(&server, "").await;
    let err = fs.purge().await.unwrap_err();
    assert!(err.to_string().contains("can't purge root directory"));
}

#[tokio::test]
async fn rmdir_is_not_recursive() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![folder("30", "old")]).await;
    Mock::given(method("DELETE"))
        .and(path("/folders/30"))
        .and(query_param("recursive", "false"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let fs = connect(&server, "").await;
    fs.rmdir("old").await.unwrap();
    assert_eq!(fs.dir_cache().get("old"), None);
}

#[tokio::test]
async fn purge_deletes_recursively() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![folder("30", "stuff")]).await;
    Mock::given(method("DELETE"))
        .and(path("/folders/30"))
        .and(query_param("recursive", "true"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let fs = connect(&server, "stuff").await;
    fs.purge().await.unwrap();
    assert!(!fs.dir_cache().found_root());
}

#[tokio::test]
async fn root_naming_a_file_roots_at_parent() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![folder("40", "dir")]).await;
    mount_listing(&server, "40", vec![file("41", "file.txt", 3)]).await;

    let (fs, kind) = BoxFs::new_unchecked("box", "dir/file.txt", options(&server))
        .await
        .unwrap();
    assert_eq!(kind, RootKind::File);
    assert_eq!(fs.root(), "dir");
}

#[tokio::test]
async fn missing_root_is_a_directory_to_be_made() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![]).await;

    let (fs, kind) = BoxFs::new_unchecked("box", "new/dir", options(&server))
        .await
        .unwrap();
    assert_eq!(kind, RootKind::Directory);
    assert_eq!(fs.root(), "new/dir");
    assert!(fs.list("").await.unwrap_err().is_dir_not_found());
}

#[tokio::test]
async fn expired_token_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/folders/0/items"))
        .respond_with(
            ResponseTemplate::new(401)
                .insert_header("www-authenticate", r#"Bearer error="invalid_token", expired_token"#),
        )
        .with_priority(1)
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    mount_listing(&server, "0", vec![file("1", "a.txt", 1)]).await;

    let fs = connect(&server, "").await;
    let entries = fs.list("").await.unwrap();
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn forbidden_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/folders/0/items"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "type": "error",
            "status": 403,
            "code": "access_denied_insufficient_permissions",
            "message": "Access denied"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let fs = connect(&server, "").await;
    let err = fs.list("").await.unwrap_err();
    let http = err.http().unwrap();
    assert_eq!(http.status, 403);
    assert_eq!(http.code.as_deref(), Some("access_denied_insufficient_permissions"));
}

#[tokio::test]
async fn open_sends_range() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![file("9", "a.txt", 5)]).await;
    Mock::given(method("GET"))
        .and(path("/files/9/content"))
        .and(header("range", "bytes=2-"))
        .respond_with(ResponseTemplate::new(206).set_body_string("llo"))
        .expect(1)
        .mount(&server)
        .await;

    let fs = connect(&server, "").await;
    let object = fs.new_object("a.txt").await.unwrap();
    let mut reader = object.open(&[OpenOption::Seek(2)]).await.unwrap();
    let mut body = String::new();
    reader.read_to_string(&mut body).await.unwrap();
    assert_eq!(body, "llo");
}

#[tokio::test]
async fn download_cut_short_is_retryable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 4096];
        let _ = socket.read(&mut request).await;
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n0123456789")
            .await
            .unwrap();
        socket.shutdown().await.ok();
    });

    let fs = BoxFs::new_unchecked("box", "", options_for(&format!("http://{addr}")))
        .await
        .unwrap()
        .0;
    let item: crate::api::Item = serde_json::from_value(file("9", "a.txt", 100)).unwrap();
    let object = crate::object::BoxObject::from_item(fs, "a.txt", &item).unwrap();

    let mut reader = object.open(&[]).await.unwrap();
    let mut body = Vec::new();
    let err = reader.read_to_end(&mut body).await.unwrap_err();
    let err = Error::from(err);
    assert!(is_retryable_error(&err), "not retryable: {err:?}");
}

#[tokio::test]
async fn set_mod_time_replaces_metadata() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![file("9", "a.txt", 5)]).await;
    let mut updated = file("9", "a.txt", 5);
    updated["content_modified_at"] = json!("2025-06-07T08:09:10Z");
    Mock::given(method("PUT"))
        .and(path("/files/9"))
        .and(body_json(json!({"content_modified_at": "2025-06-07T08:09:10Z"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(updated))
        .expect(1)
        .mount(&server)
        .await;

    let fs = connect(&server, "").await;
    let mut object = fs.new_object("a.txt").await.unwrap();
    let when: Timestamp = "2025-06-07T08:09:10Z".parse().unwrap();
    object.set_mod_time(when).await.unwrap();
    assert_eq!(object.mod_time().await.unwrap(), when);
}

#[tokio::test]
async fn remove_deletes_file() {
    let server = MockServer::start().await;
    mount_listing(&server, "0", vec![file("9", "a.txt", 5)]).await;
    Mock::given(method("DELETE"))
        .and(path("/files/9"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let fs = connect(&server, "").await;
    let object = fs.new_object("a.txt").await.unwrap();
    object.remove().await.unwrap();
}

#[tokio::test]
async fn features_and_display() {
    let server = MockServer::start().await;
    let fs = connect(&server, "").await;
    let features = fs.features();
    assert!(features.case_insensitive);
    assert!(features.dir_move);
    assert_eq!(fs.precision(), Duration::from_secs(1));
    assert!(fs.hashes().contains(HashType::Sha1));
    assert_eq!(fs.to_string(), "box root ''");
}
