use std::fs;

use mockito::Matcher;
use proknow_rs::{Config, Credentials, ProKnow, ProKnowError};
use serde_json::json;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

fn client(url: String) -> ProKnow {
    ProKnow::new(Config::new(url, Credentials::new("id", "secret"))).unwrap()
}

#[tokio::test]
async fn requests_authenticate_with_the_api_key() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/api/user")
        .match_header("authorization", "Basic aWQ6c2VjcmV0")
        .match_header("accept", "application/json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id":"5c4b4b3e","name":"Jane Doe"}"#)
        .create_async()
        .await;

    let session = client(server.url()).session().await.unwrap();

    assert_eq!(session["name"], "Jane Doe");
    mock.assert_async().await;
}

#[tokio::test]
async fn error_status_keeps_the_body_verbatim() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/api/workspaces/abc/structuresets/def/draft")
        .with_status(409)
        .with_body("Structure set is already locked")
        .create_async()
        .await;

    let pk = client(server.url());
    let err = pk
        .requestor()
        .post("/workspaces/abc/structuresets/def/draft")
        .send()
        .await
        .unwrap_err();

    match &err {
        ProKnowError::Http { status, body } => {
            assert_eq!(*status, 409);
            assert_eq!(body, "Structure set is already locked");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(err.is_conflict());
}

#[tokio::test]
async fn query_and_headers_are_forwarded() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/api/structuresets/def/rois/7")
        .match_query(Matcher::UrlEncoded("version".into(), "draft".into()))
        .match_header("ProKnow-Key", "k3y")
        .with_status(200)
        .with_body(r#"{"contours":[]}"#)
        .create_async()
        .await;

    let pk = client(format!("{}/", server.url()));
    let data: serde_json::Value = pk
        .requestor()
        .get("/structuresets/def/rois/7")
        .query("version", "draft")
        .header("ProKnow-Key", "k3y")
        .fetch()
        .await
        .unwrap();

    assert_eq!(data["contours"], json!([]));
    mock.assert_async().await;
}

#[tokio::test]
async fn json_bodies_are_sent_as_json() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/workspaces")
        .match_header("content-type", "application/json")
        .match_body(Matcher::Json(json!({"slug": "clinical", "name": "Clinical"})))
        .with_status(200)
        .with_body(r#"{"id":"abc","slug":"clinical","name":"Clinical","protected":false}"#)
        .create_async()
        .await;

    let pk = client(server.url());
    pk.requestor()
        .post("/workspaces")
        .json(&json!({"slug": "clinical", "name": "Clinical"}))
        .send()
        .await
        .unwrap();

    mock.assert_async().await;
}

#[tokio::test]
async fn downloads_are_streamed_to_disk() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/workspaces/abc/structuresets/def/versions/v1/dicom")
        .with_status(200)
        .with_body(b"DICM-payload".to_vec())
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("RS.v1.dcm");
    client(server.url())
        .requestor()
        .get("/workspaces/abc/structuresets/def/versions/v1/dicom")
        .stream_to(&path)
        .await
        .unwrap();

    assert_eq!(fs::read(&path).unwrap(), b"DICM-payload");
}

#[tokio::test]
async fn failed_download_is_an_http_error() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/api/workspaces/abc/images/missing/dicom")
        .with_status(404)
        .with_body("Not found")
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.dcm");
    let err = client(server.url())
        .requestor()
        .get("/workspaces/abc/images/missing/dicom")
        .stream_to(&path)
        .await
        .unwrap_err();

    assert!(err.is_not_found());
    assert!(!path.exists());
}

#[tokio::test]
async fn truncated_error_body_is_not_reported_as_empty() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 4096];
        let _ = socket.read(&mut request).await;
        socket
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 100\r\n\r\nNot fo")
            .await
            .unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.dcm");
    let err = client(url)
        .requestor()
        .get("/workspaces/abc/images/missing/dicom")
        .stream_to(&path)
        .await
        .unwrap_err();

    assert!(matches!(err, ProKnowError::Request(_)), "{:?}", err);
    assert!(!path.exists());
}

#[tokio::test]
async fn chunks_are_sent_as_multipart_forms() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/api/uploads/chunks")
        .match_header("ProKnow-Key", "upload-key")
        .match_header(
            "content-type",
            Matcher::Regex("^multipart/form-data; boundary=".to_string()),
        )
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#"name="flowChunkNumber""#.to_string()),
            Matcher::Regex(r#"name="flowIdentifier""#.to_string()),
            Matcher::Regex(r#"filename="CT.1.dcm""#.to_string()),
            Matcher::Regex("DICM-content".to_string()),
        ]))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("CT.1.dcm");
    fs::write(&path, "DICM-content").unwrap();
    let fields = vec![
        ("flowChunkNumber".to_string(), "1".to_string()),
        ("flowIdentifier".to_string(), "upload-id".to_string()),
    ];

    client(server.url())
        .requestor()
        .post("/uploads/chunks")
        .header("ProKnow-Key", "upload-key")
        .file(fields, &path)
        .send()
        .await
        .unwrap();

    mock.assert_async().await;
}
