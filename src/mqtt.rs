//! MQTT event loop driving an `IngestionGateway`.

use crate::config::BrokerSettings;
use crate::error::PipelineError;
use crate::ingest::{BrokerLike, IngestionGateway};
use crate::shutdown::sleep_unless_cancelled;
use crate::store::MeasurementStoreLike;
use rumqttc::{Client, Event, MqttOptions, Packet, QoS, RecvTimeoutError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

pub struct MqttBroker {
    client: Client,
}

impl BrokerLike for MqttBroker {
    fn subscribe(&mut self, topic: &str) -> Result<(), PipelineError> {
        self.client.try_subscribe(topic, QoS::ExactlyOnce)?;
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), PipelineError> {
        self.client.try_unsubscribe(topic)?;
        Ok(())
    }
}

/// Run until `cancel` fires. Messages already received are handled to
/// completion before the loop exits.
pub fn run_gateway<S: MeasurementStoreLike>(
    gateway: &mut IngestionGateway<S>,
    settings: &BrokerSettings,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let mut options = MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
    options.set_keep_alive(settings.keep_alive());
    options.set_clean_session(false);
    let (client, mut connection) = Client::new(options, settings.channel_capacity);
    let mut broker = MqttBroker { client };

    gateway.connecting();
    info!(host = %settings.host, port = settings.port, "connecting to broker");
    let mut last_reconcile = Instant::now();
    let mut last_gap_report = Instant::now();

    while !cancel.is_cancelled() {
        match connection.recv_timeout(POLL_INTERVAL) {
            Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                info!("broker connection established");
                if let Err(e) = gateway.on_connected(&mut broker) {
                    error!(error = %e, "node registry query failed, will retry on reconcile");
                }
                last_reconcile = Instant::now();
            }
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                gateway.handle_message(&publish.payload);
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                gateway.disconnected();
                warn!(error = %e, "broker connection error");
                if !sleep_unless_cancelled(cancel, RECONNECT_BACKOFF) {
                    break;
                }
                gateway.connecting();
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(PipelineError::Broker("event loop closed".to_string()));
            }
        }

        if last_reconcile.elapsed() >= settings.reconcile_interval() {
            last_reconcile = Instant::now();
            if let Err(e) = gateway.reconcile(&mut broker) {
                error!(error = %e, "subscription reconcile failed");
            }
        }
        if last_gap_report.elapsed() >= settings.gap_report_interval() {
            last_gap_report = Instant::now();
            gateway.report_gaps();
        }
    }

    info!(stats = ?gateway.stats(), "gateway stopping");
    gateway.report_gaps();
    if let Err(e) = broker.client.disconnect() {
        warn!(error = %e, "broker disconnect failed");
    }
    gateway.disconnected();
    Ok(())
}
