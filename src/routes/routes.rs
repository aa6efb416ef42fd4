//! Routes of the live datastream service.
//!
//! - `GET    /healthz`, `GET /readyz`
//! - `POST   /datastreams/{oid}` : upload staged files (JSON list of datastreams)
//! - `PUT    /datastreams/{oid}` : apply an attachment list change (`previous`, `current`)
//! - `GET    /datastreams/{oid}?fileId=` : list attachments
//! - `GET    /datastreams/{oid}/{fileId}` : stream one attachment
//! - `DELETE /datastreams/{oid}/{fileId}` : remove one attachment

use crate::{
    handlers::{
        datastream_handlers::{
            add_datastreams, get_datastream, list_datastreams, remove_datastream,
            update_datastreams,
        },
        health_handlers::{healthz, readyz},
    },
    services::datastream_service::DatastreamService,
};
use axum::{Router, routing::get};

pub fn routes() -> Router<DatastreamService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/datastreams/{oid}",
            get(list_datastreams)
                .post(add_datastreams)
                .put(update_datastreams),
        )
        .route(
            "/datastreams/{oid}/{file_id}",
            get(get_datastream).delete(remove_datastream),
        )
}
