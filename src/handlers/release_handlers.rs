//! HTTP handlers for deployments and releases.
//!
//! Upload intake streams the multipart `package` field to the staging area
//! and hands the file to `ReleaseService`; everything else is a thin read
//! over the metadata store.

use crate::{
    errors::AppError,
    models::{
        deployment::Deployment,
        package::{Package, PackageInfo},
    },
    services::{error::ReleaseError, release_service::ReleaseService},
};
use axum::{
    Json,
    extract::{Multipart, Path, State, multipart::Field},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde::Deserialize;
use std::path::{Path as FsPath, PathBuf};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};

const RELEASED_BY_HEADER: &str = "x-released-by";
const DEFAULT_RELEASED_BY: &str = "anonymous";
const DEFAULT_ARCHIVE_TYPE: &str = "application/octet-stream";

/// Body for `POST /deployments`.
#[derive(Debug, Deserialize)]
pub struct CreateDeploymentReq {
    pub name: String,
}

/// Parsed multipart upload.
#[derive(Debug)]
struct UploadIntake {
    info: PackageInfo,
    archive_path: PathBuf,
    mime_type: String,
}

/// `POST /deployments`: create a deployment.
pub async fn create_deployment(
    State(service): State<ReleaseService>,
    Json(payload): Json<CreateDeploymentReq>,
) -> Result<impl IntoResponse, AppError> {
    let deployment: Deployment = service.create_deployment(&payload.name).await?;
    Ok((StatusCode::CREATED, Json(deployment)))
}

/// `POST /deployments/{deployment_id}/releases`: upload and release a package.
pub async fn upload_release(
    State(service): State<ReleaseService>,
    Path(deployment_id): Path<i64>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let released_by = headers
        .get(RELEASED_BY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_RELEASED_BY)
        .to_string();

    let upload_path = service.archive_stage().upload_path();
    let intake = match read_upload(multipart, &upload_path).await {
        Ok(intake) => intake,
        Err(err) => {
            remove_upload(&upload_path).await;
            return Err(err.into());
        }
    };

    let result = release_staged(&service, deployment_id, &intake, &released_by).await;
    remove_upload(&intake.archive_path).await;

    let package = result?;
    Ok((StatusCode::CREATED, Json(package)))
}

/// Run the pipeline and discard its staging directory whatever the outcome.
async fn release_staged(
    service: &ReleaseService,
    deployment_id: i64,
    intake: &UploadIntake,
    released_by: &str,
) -> Result<Package, ReleaseError> {
    let staged = service
        .prepare(
            deployment_id,
            &intake.info,
            &intake.archive_path,
            &intake.mime_type,
        )
        .await?;
    let result = service
        .release_prepared(deployment_id, &intake.info, &staged, released_by)
        .await;
    if let Err(err) = service.archive_stage().discard(&staged).await {
        warn!(
            "failed to clean staging for {}: {}",
            staged.archive_hash, err
        );
    }
    result
}

/// `GET /deployments/{deployment_id}/versions/{app_version}/packages`: release history.
pub async fn list_packages(
    State(service): State<ReleaseService>,
    Path((deployment_id, app_version)): Path<(i64, String)>,
) -> Result<Json<Vec<Package>>, AppError> {
    Ok(Json(
        service.list_packages(deployment_id, &app_version).await?,
    ))
}

/// `GET /deployments/{deployment_id}/packages/{label}`: one release by label.
pub async fn get_package(
    State(service): State<ReleaseService>,
    Path((deployment_id, label)): Path<(i64, String)>,
) -> Result<Json<Package>, AppError> {
    Ok(Json(
        service.find_package_by_label(deployment_id, &label).await?,
    ))
}

/// `GET /deployments/{deployment_id}/orphans`: packages whose pointer update failed.
pub async fn list_orphans(
    State(service): State<ReleaseService>,
    Path(deployment_id): Path<i64>,
) -> Result<Json<Vec<Package>>, AppError> {
    Ok(Json(service.list_orphaned_packages(deployment_id).await?))
}

/// Pull `packageInfo` and `package` out of the multipart body, streaming
/// the archive to `dest`.
async fn read_upload(mut multipart: Multipart, dest: &FsPath) -> Result<UploadIntake, ReleaseError> {
    let mut info = None;
    let mut mime_type = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ReleaseError::UploadMalformed(format!("upload error: {}", err)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("packageInfo") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|err| ReleaseError::UploadMalformed(err.to_string()))?;
                let parsed: PackageInfo = serde_json::from_str(&raw).map_err(|err| {
                    ReleaseError::UploadMalformed(format!("invalid packageInfo: {}", err))
                })?;
                info = Some(parsed);
            }
            Some("package") => {
                let content_type = field
                    .content_type()
                    .unwrap_or(DEFAULT_ARCHIVE_TYPE)
                    .to_string();
                let size = save_field(field, dest).await?;
                debug!("received {} byte upload at {}", size, dest.display());
                mime_type = Some(content_type);
            }
            other => debug!("ignoring multipart field {:?}", other),
        }
    }

    match (info, mime_type) {
        (Some(info), Some(mime_type)) => Ok(UploadIntake {
            info,
            archive_path: dest.to_path_buf(),
            mime_type,
        }),
        _ => Err(ReleaseError::UploadMalformed("upload info lack".into())),
    }
}

async fn save_field(mut field: Field<'_>, dest: &FsPath) -> Result<u64, ReleaseError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = File::create(dest).await?;
    let mut size: u64 = 0;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|err| ReleaseError::UploadMalformed(format!("upload error: {}", err)))?
    {
        size += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(size)
}

async fn remove_upload(path: &FsPath) {
    match fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!("failed to remove upload {}: {}", path.display(), err),
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        routes::routes::routes,
        services::{
            archive::{ArchiveStage, tests::write_zip},
            blob_store::DiskBlobStore,
            manifest::ManifestBuilder,
            metadata_store::{MetadataStore, tests::memory_store},
            release_service::ReleaseService,
        },
    };
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Request, StatusCode, header},
    };
    use serde_json::Value;
    use std::{path::Path, sync::Arc};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "release-registry-test-boundary";

    struct TestApp {
        dir: TempDir,
        router: Router,
        deployment: i64,
    }

    async fn app() -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let store = memory_store().await;
        let deployment = store.create_deployment("Staging").await.unwrap().id;
        let service = ReleaseService::new(
            Arc::new(store),
            Arc::new(DiskBlobStore::new(dir.path().join("blobs"))),
            ArchiveStage::new(dir.path().join("staging")),
            ManifestBuilder::new(2),
        );
        TestApp {
            router: routes(1024 * 1024).with_state(service),
            dir,
            deployment,
        }
    }

    enum Part<'a> {
        Text(&'a str, &'a str),
        File(&'a str, &'a str, Vec<u8>),
    }

    fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part {
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name)
                            .as_bytes(),
                    );
                    body.extend_from_slice(value.as_bytes());
                }
                Part::File(name, content_type, bytes) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{}\"; filename=\"bundle.zip\"\r\n\
                             Content-Type: {}\r\n\r\n",
                            name, content_type
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(bytes);
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn zip_bytes(dir: &Path, entries: &[(&str, &[u8])]) -> Vec<u8> {
        let path = dir.join(format!("{}.zip", uuid::Uuid::new_v4()));
        write_zip(&path, entries);
        std::fs::read(path).unwrap()
    }

    fn upload_request(deployment: i64, released_by: Option<&str>, parts: &[Part<'_>]) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/deployments/{}/releases", deployment))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            );
        if let Some(who) = released_by {
            builder = builder.header("x-released-by", who);
        }
        builder.body(Body::from(multipart_body(parts))).unwrap()
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    /// Directories left under the staging root, ignoring the uploads area.
    fn staging_leftovers(app: &TestApp) -> Vec<String> {
        let staging = app.dir.path().join("staging");
        let Ok(entries) = std::fs::read_dir(&staging) else {
            return Vec::new();
        };
        let mut names = entries
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect::<Vec<_>>();
        names.retain(|name| name != "uploads");
        names
    }

    fn uploads_left(app: &TestApp) -> usize {
        std::fs::read_dir(app.dir.path().join("staging").join("uploads"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn upload_without_package_field_is_rejected() {
        let app = app().await;
        let request = upload_request(
            app.deployment,
            None,
            &[Part::Text("packageInfo", r#"{"appVersion":"1.0"}"#)],
        );

        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("upload info lack"));
    }

    #[tokio::test]
    async fn upload_without_package_info_is_rejected() {
        let app = app().await;
        let zip = zip_bytes(app.dir.path(), &[("index.bundle", b"c1".as_slice())]);
        let request = upload_request(
            app.deployment,
            None,
            &[Part::File("package", "application/zip", zip)],
        );

        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("upload info lack"));
        assert_eq!(uploads_left(&app), 0);
    }

    #[tokio::test]
    async fn invalid_package_info_is_rejected() {
        let app = app().await;
        let zip = zip_bytes(app.dir.path(), &[("index.bundle", b"c1".as_slice())]);
        let request = upload_request(
            app.deployment,
            None,
            &[
                Part::Text("packageInfo", "{not json"),
                Part::File("package", "application/zip", zip),
            ],
        );

        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invalid packageInfo"));
    }

    #[tokio::test]
    async fn release_defaults_released_by_and_cleans_up() {
        let app = app().await;
        let zip = zip_bytes(app.dir.path(), &[("index.bundle", b"c1".as_slice())]);
        let parts = [
            Part::Text("packageInfo", r#"{"appVersion":"1.0","isMandatory":true}"#),
            Part::File("package", "application/zip", zip),
        ];

        let (status, body) = send(&app, upload_request(app.deployment, None, &parts)).await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["releasedBy"], "anonymous");
        assert_eq!(body["label"], "v1");
        assert_eq!(body["isMandatory"], true);
        assert!(staging_leftovers(&app).is_empty());
        assert_eq!(uploads_left(&app), 0);

        let zip = zip_bytes(app.dir.path(), &[("index.bundle", b"c2".as_slice())]);
        let parts = [
            Part::Text("packageInfo", r#"{"appVersion":"1.0"}"#),
            Part::File("package", "application/zip", zip),
        ];
        let (status, body) =
            send(&app, upload_request(app.deployment, Some("  bob "), &parts)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["releasedBy"], "bob");
        assert_eq!(body["label"], "v2");
    }

    #[tokio::test]
    async fn rejected_release_leaves_no_staging_behind() {
        let app = app().await;
        let zip = zip_bytes(app.dir.path(), &[("index.bundle", b"c1".as_slice())]);
        let parts = [
            Part::Text("packageInfo", r#"{"appVersion":"1.0"}"#),
            Part::File("package", "application/zip", zip),
        ];
        let (status, _) = send(&app, upload_request(app.deployment, None, &parts)).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = send(&app, upload_request(app.deployment, None, &parts)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].is_string());
        assert!(staging_leftovers(&app).is_empty());

        let evil = zip_bytes(app.dir.path(), &[("../escape.txt", b"x".as_slice())]);
        let parts = [
            Part::Text("packageInfo", r#"{"appVersion":"1.0"}"#),
            Part::File("package", "application/zip", evil),
        ];
        let (status, _) = send(&app, upload_request(app.deployment, None, &parts)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(staging_leftovers(&app).is_empty());
        assert_eq!(uploads_left(&app), 0);
    }

    #[tokio::test]
    async fn upload_to_unknown_deployment_is_not_found() {
        let app = app().await;
        let zip = zip_bytes(app.dir.path(), &[("index.bundle", b"c1".as_slice())]);
        let parts = [
            Part::Text("packageInfo", r#"{"appVersion":"1.0"}"#),
            Part::File("package", "application/zip", zip),
        ];

        let (status, _) = send(&app, upload_request(4242, None, &parts)).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(uploads_left(&app), 0);
    }
}
