//! Stand-alone receiver for alert notifications. Each route logs the alert and
//! acknowledges it with a fixed message; `/metrics` counts receipts per route.

use std::net::SocketAddr;

use actix_web::{App, HttpResponse, HttpServer, web};
use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{info, warn};

use crate::{
    notify::{AlertAck, AlertRoute},
    pipeline::telemetry,
    server::render_metrics,
};

pub(crate) fn configure(cfg: &mut web::ServiceConfig) {
    for route in AlertRoute::ALL {
        cfg.route(
            &format!("/{}", route.path()),
            web::get().to(move || acknowledge(route)),
        );
    }
    cfg.route("/metrics", web::get().to(metrics_handler));
}

fn record_receipt(route: AlertRoute) {
    metrics::counter!("railguard_alerts_received_total", "route" => route.path()).increment(1);
}

async fn acknowledge(route: AlertRoute) -> HttpResponse {
    let alert = route.acknowledgement();
    warn!(route = route.path(), "{alert}");
    record_receipt(route);
    HttpResponse::Ok().json(AlertAck {
        alert: alert.to_string(),
    })
}

async fn metrics_handler(handle: Option<web::Data<PrometheusHandle>>) -> HttpResponse {
    render_metrics(handle.as_ref().map(|data| data.get_ref()))
}

/// Serve the alert routes on `bind` until Ctrl+C.
pub fn run_alert_endpoint(bind: SocketAddr) -> Result<()> {
    let prometheus = match telemetry::init_metrics_recorder() {
        Ok(handle) => Some(web::Data::new(handle.clone())),
        Err(err) => {
            warn!("metrics disabled: {err:#}");
            None
        }
    };
    actix_web::rt::System::new().block_on(async move {
        let server = HttpServer::new(move || {
            let app = App::new().configure(configure);
            match prometheus.clone() {
                Some(handle) => app.app_data(handle),
                None => app,
            }
        })
        .bind(bind)
        .with_context(|| format!("failed to bind alert endpoint to {bind}"))?
        .run();
        info!(%bind, "alert endpoint listening");
        server.await.context("alert endpoint failed")
    })
}

#[cfg(test)]
mod tests {
    use actix_web::{http::StatusCode, test};
    use metrics_exporter_prometheus::PrometheusBuilder;

    use super::*;

    #[actix_web::test]
    async fn every_route_acknowledges_its_alert() {
        let app = test::init_service(App::new().configure(configure)).await;
        for route in AlertRoute::ALL {
            let req = test::TestRequest::get()
                .uri(&format!("/{}", route.path()))
                .to_request();
            let ack: AlertAck = test::call_and_read_body_json(&app, req).await;
            assert_eq!(ack.alert, route.acknowledgement());
        }
    }

    #[actix_web::test]
    async fn track_alert_text() {
        let app = test::init_service(App::new().configure(configure)).await;
        let req = test::TestRequest::get().uri("/track_alert").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(
            body,
            serde_json::json!({"alert": "Person on railway track! Emergency alert triggered!"})
        );
    }

    #[actix_web::test]
    async fn unknown_route_is_not_found() {
        let app = test::init_service(App::new().configure(configure)).await;
        let req = test::TestRequest::get().uri("/theft_alert").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn metrics_route_exposes_receipt_counts() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || record_receipt(AlertRoute::Fire));

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(handle))
                .configure(configure),
        )
        .await;
        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(
            text.contains(r#"railguard_alerts_received_total{route="fire_alert"} 1"#),
            "{text}"
        );
    }

    #[actix_web::test]
    async fn metrics_route_without_recorder_is_unavailable() {
        let app = test::init_service(App::new().configure(configure)).await;
        let req = test::TestRequest::get().uri("/metrics").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
