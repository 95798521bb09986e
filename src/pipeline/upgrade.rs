//! h2c upgrade stage (`http2-upgrade`).
//!
//! Installed on cleartext listeners ahead of the HTTP/1.1 chain. An
//! acceptable upgrade request is answered with `101 Switching Protocols`
//! and handed to the connection task; everything else flows on untouched.

use std::convert::Infallible;

use hyper::header::{HeaderValue, CONNECTION, UPGRADE};
use hyper::{Request, Response, StatusCode};
use tower::util::BoxCloneService;
#[cfg(test)]
use tower::ServiceExt;

use crate::http::body::{self, Body};
use crate::negotiation::h2c::{self, PendingUpgrade, UpgradeSlot};
use crate::pipeline::{error_response, HttpService, Stage, StageKind};

#[derive(Clone)]
pub struct UpgradeStage {
    slot: UpgradeSlot,
}

impl UpgradeStage {
    pub fn new(slot: UpgradeSlot) -> Self {
        Self { slot }
    }
}

fn switching_protocols() -> Response<Body> {
    let mut response = Response::new(body::empty());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    response.headers_mut().insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    response.headers_mut().insert(UPGRADE, HeaderValue::from_static("h2c"));
    response
}

impl Stage for UpgradeStage {
    fn kind(&self) -> StageKind {
        StageKind::Http2Upgrade
    }

    fn wrap(&self, inner: HttpService) -> HttpService {
        let slot = self.slot.clone();
        BoxCloneService::new(tower::service_fn(move |mut req: Request<Body>| {
            let inner = inner.clone();
            let slot = slot.clone();
            async move {
                let Some(settings) = h2c::upgrade_settings(req.headers()) else {
                    return super::oneshot(inner, req).await;
                };
                // Only the first accepted upgrade switches the connection.
                let Some(tx) = slot.lock().ok().and_then(|mut slot| slot.take()) else {
                    return super::oneshot(inner, req).await;
                };

                let on_upgrade = hyper::upgrade::on(&mut req);
                let (head, _) = req.into_parts();
                tracing::debug!(
                    target_uri = %head.uri,
                    settings_len = settings.len(),
                    "Accepting h2c upgrade"
                );

                if tx.send(PendingUpgrade { on_upgrade, settings, head }).is_err() {
                    tracing::warn!("Connection task no longer waiting for h2c upgrade");
                    return Ok::<_, Infallible>(error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        true,
                    ));
                }
                Ok(switching_protocols())
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::h2c::{upgrade_channel, HTTP2_SETTINGS};
    use crate::pipeline::testing::{h1_codec, recording};
    use crate::pipeline::PipelineBuilder;
    use std::sync::{Arc, Mutex};

    fn upgrade_request() -> Request<Body> {
        Request::get("/x")
            .header("host", "h")
            .header(CONNECTION, "Upgrade, HTTP2-Settings")
            .header(UPGRADE, "h2c")
            .header(HTTP2_SETTINGS, "AAMAAABkAAQAAP__")
            .body(body::empty())
            .unwrap()
    }

    fn service(slot: UpgradeSlot, log: &Arc<Mutex<Vec<String>>>) -> HttpService {
        PipelineBuilder::new(h1_codec())
            .add_last(recording(StageKind::Decoder, log)).unwrap()
            .add_last(UpgradeStage::new(slot)).unwrap()
            .add_last(recording(StageKind::Handler, log)).unwrap()
            .build()
            .unwrap()
            .into_service()
    }

    #[tokio::test]
    async fn accepted_upgrade_answers_101_without_reaching_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (slot, mut rx) = upgrade_channel();

        let response = service(slot, &log).oneshot(upgrade_request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()[UPGRADE], "h2c");

        let pending = rx.try_recv().unwrap();
        assert_eq!(pending.settings.len(), 12);
        assert_eq!(pending.head.uri.path(), "/x");
        assert!(!log.lock().unwrap().iter().any(|e| e == "in:handler"));
    }

    #[tokio::test]
    async fn plain_requests_flow_through() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (slot, mut rx) = upgrade_channel();

        let request = Request::get("/x").body(body::empty()).unwrap();
        let response = service(slot, &log).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn second_upgrade_is_declined() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (slot, _rx) = upgrade_channel();
        let svc = service(slot, &log);

        let first = svc.clone().oneshot(upgrade_request()).await.unwrap();
        assert_eq!(first.status(), StatusCode::SWITCHING_PROTOCOLS);

        let second = svc.oneshot(upgrade_request()).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
    }
}
