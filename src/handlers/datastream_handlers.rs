//! HTTP handlers for the live datastream service.
//! Downloads are streamed straight from the object store to the client.

use crate::{
    errors::AppError,
    models::{datastream::Datastream, relation::AttachmentView},
    services::datastream_service::{BatchResponse, DatastreamService},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub file_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveQuery {
    pub cloud_type: Option<String>,
    pub bucket: Option<String>,
}

/// `POST /datastreams/{oid}` with a JSON list of datastreams staged for upload.
pub async fn add_datastreams(
    State(service): State<DatastreamService>,
    Path(oid): Path<String>,
    Json(datastreams): Json<Vec<Datastream>>,
) -> (StatusCode, Json<BatchResponse>) {
    batch_reply(service.add_many(&oid, &datastreams).await)
}

fn batch_reply(response: BatchResponse) -> (StatusCode, Json<BatchResponse>) {
    let status = if response.success {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };
    (status, Json(response))
}

#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub previous: Vec<Datastream>,
    #[serde(default)]
    pub current: Vec<Datastream>,
}

/// `PUT /datastreams/{oid}`: sync the attachment list of a record from `previous` to `current`.
pub async fn update_datastreams(
    State(service): State<DatastreamService>,
    Path(oid): Path<String>,
    Json(req): Json<UpdateRequest>,
) -> (StatusCode, Json<BatchResponse>) {
    batch_reply(service.update(&oid, &req.previous, &req.current).await)
}

/// `GET /datastreams/{oid}?fileId=`
pub async fn list_datastreams(
    State(service): State<DatastreamService>,
    Path(oid): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<AttachmentView>>, AppError> {
    Ok(Json(service.list(&oid, query.file_id.as_deref()).await?))
}

/// `GET /datastreams/{oid}/{fileId}` as a streaming response.
pub async fn get_datastream(
    State(service): State<DatastreamService>,
    Path((oid, file_id)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let reader = service.get(&oid, &file_id).await?;
    let mime_type = service
        .list(&oid, Some(&file_id))
        .await?
        .into_iter()
        .next()
        .and_then(|view| view.metadata.mime_type);

    let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        mime_type
            .and_then(|mime| HeaderValue::from_str(&mime).ok())
            .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream")),
    );
    Ok(response)
}

/// `DELETE /datastreams/{oid}/{fileId}`
pub async fn remove_datastream(
    State(service): State<DatastreamService>,
    Path((oid, file_id)): Path<(String, String)>,
    Query(query): Query<RemoveQuery>,
) -> Result<impl IntoResponse, AppError> {
    let datastream = Datastream {
        cloud_type: query.cloud_type,
        bucket: query.bucket,
        ..Datastream::new(file_id)
    };
    service.remove(&oid, &datastream).await?;
    Ok(StatusCode::NO_CONTENT)
}
