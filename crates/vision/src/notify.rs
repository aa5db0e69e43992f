//! Outbound alert notifications.
//!
//! The pipeline hands routes to a [`Notifier`] and moves on. [`HttpNotifier`]
//! queues them on a bounded channel drained by one worker thread, so a hung
//! endpoint costs at most one request timeout on that thread and never stalls
//! a cycle.

use std::{fmt, sync::Arc, thread, time::Duration};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{display::Display, pipeline::telemetry};

pub const NOTIFY_QUEUE_CAPACITY: usize = 32;

/// Named routes on the notification endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertRoute {
    Weapon,
    Track,
    Fall,
    Fire,
    Crime,
}

impl AlertRoute {
    pub const ALL: [AlertRoute; 5] = [
        AlertRoute::Weapon,
        AlertRoute::Track,
        AlertRoute::Fall,
        AlertRoute::Fire,
        AlertRoute::Crime,
    ];

    pub fn path(self) -> &'static str {
        match self {
            AlertRoute::Weapon => "weapon_alert",
            AlertRoute::Track => "track_alert",
            AlertRoute::Fall => "fall_alert",
            AlertRoute::Fire => "fire_alert",
            AlertRoute::Crime => "crime_alert",
        }
    }

    /// Acknowledgement text returned by the endpoint for this route.
    pub fn acknowledgement(self) -> &'static str {
        match self {
            AlertRoute::Weapon => "Weapon detected! Security alert triggered!",
            AlertRoute::Track => "Person on railway track! Emergency alert triggered!",
            AlertRoute::Fall => "Fall detected! Emergency alert triggered!",
            AlertRoute::Fire => "Fire detected! Emergency alert triggered!",
            AlertRoute::Crime => "Crime activity detected and alert triggered!",
        }
    }
}

impl fmt::Display for AlertRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// JSON body of every endpoint response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertAck {
    pub alert: String,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{0}")]
    Request(#[from] reqwest::Error),
    #[error("endpoint answered {0}")]
    Status(reqwest::StatusCode),
}

/// Fire-and-forget notification sink. Implementations must return promptly.
pub trait Notifier: Send + Sync {
    fn notify(&self, route: AlertRoute);
}

/// Discards every route. Used when no endpoint is configured.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, route: AlertRoute) {
        debug!(route = route.path(), "notification discarded");
    }
}

pub struct HttpNotifier {
    tx: Option<Sender<AlertRoute>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl HttpNotifier {
    /// Start the delivery worker. Failures are logged and reported to
    /// `display` as non-important entries; nothing is retried.
    pub fn spawn(base_url: &str, timeout: Duration, display: Arc<dyn Display>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build notification client")?;
        let base_url = base_url.trim_end_matches('/').to_string();
        let (tx, rx) = crossbeam_channel::bounded(NOTIFY_QUEUE_CAPACITY);
        let worker = telemetry::spawn_thread("railguard-notify", move || {
            delivery_loop(&client, &base_url, rx, display.as_ref())
        })
        .context("failed to spawn notification worker")?;
        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Close the queue and wait for in-flight deliveries to finish.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Notifier for HttpNotifier {
    fn notify(&self, route: AlertRoute) {
        let Some(tx) = self.tx.as_ref() else {
            return;
        };
        match tx.try_send(route) {
            Ok(()) => {}
            Err(TrySendError::Full(route)) => {
                warn!(route = route.path(), "notification queue full; dropping alert");
                metrics::counter!(
                    "railguard_notifications_total",
                    "route" => route.path(),
                    "outcome" => "dropped"
                )
                .increment(1);
            }
            Err(TrySendError::Disconnected(route)) => {
                warn!(route = route.path(), "notification worker has exited");
            }
        }
    }
}

impl Drop for HttpNotifier {
    fn drop(&mut self) {
        self.close();
    }
}

fn delivery_loop(
    client: &reqwest::blocking::Client,
    base_url: &str,
    rx: Receiver<AlertRoute>,
    display: &dyn Display,
) {
    for route in rx {
        let outcome = match deliver(client, base_url, route) {
            Ok(ack) => {
                debug!(route = route.path(), ack = %ack.alert, "alert delivered");
                "delivered"
            }
            Err(err) => {
                warn!(route = route.path(), "alert delivery failed: {err}");
                display.emit(&format!("Error sending alert: {err}"), false);
                "failed"
            }
        };
        metrics::counter!(
            "railguard_notifications_total",
            "route" => route.path(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

/// Issue one GET against `<base_url>/<route>` and decode the acknowledgement.
pub fn deliver(
    client: &reqwest::blocking::Client,
    base_url: &str,
    route: AlertRoute,
) -> Result<AlertAck, DeliveryError> {
    let url = format!("{base_url}/{}", route.path());
    let response = client.get(url).send()?;
    let status = response.status();
    if !status.is_success() {
        return Err(DeliveryError::Status(status));
    }
    Ok(response.json::<AlertAck>()?)
}
