use anyhow::{ensure, Context, Result};
use pylonbus_lib::poller::Publish;
use rumqttc::{Client, ClientError, Connection, MqttOptions, QoS};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConfig {
    /// Publishing is skipped entirely when false.
    pub active: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_base: String,
    pub client_id: String,
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,
    /// Capacity of the outgoing request queue.
    pub queue_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            active: true,
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            topic_base: "victron-battery-middleware".into(),
            client_id: Self::default_client_id(),
            keep_alive_interval: Duration::from_secs(30),
            queue_capacity: 10,
        }
    }
}

impl MqttConfig {
    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("pylonbus-{}", Self::generate_random_string(8))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        ensure!(!self.host.is_empty(), "mqtt.host must not be empty");
        ensure!(
            !self.topic_base.is_empty(),
            "mqtt.topic_base must not be empty"
        );
        ensure!(
            self.keep_alive_interval >= Duration::from_secs(5),
            "mqtt.keep_alive_interval must be at least 5s"
        );
        Ok(())
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive_interval);
        options.set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.as_deref().unwrap_or_default());
        }
        options
    }

    pub fn create_client(&self) -> Result<Client> {
        log::info!(
            "Connecting to MQTT broker: {}:{} with client_id: {}",
            self.host,
            self.port,
            self.client_id
        );
        let (client, connection) = Client::new(self.options(), self.queue_capacity.max(1));
        std::thread::Builder::new()
            .name("mqtt".into())
            .spawn(move || drive_connection(connection))
            .with_context(|| "Cannot spawn MQTT connection thread")?;
        Ok(client)
    }
}

/// Runs the network event loop of the client; reconnects after errors.
fn drive_connection(mut connection: Connection) {
    for notification in connection.iter() {
        match notification {
            Ok(event) => log::trace!("MQTT event: {event:?}"),
            Err(err) => {
                log::warn!("MQTT connection error: {err}");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
    log::debug!("MQTT connection closed");
}

pub struct MqttPublisher {
    client: Client,
    config: MqttConfig,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let client = config.create_client()?;
        Ok(Self { client, config })
    }

    pub fn topic_base(&self) -> &str {
        &self.config.topic_base
    }
}

impl Publish for MqttPublisher {
    type Error = ClientError;

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), ClientError> {
        log::debug!("Publishing to MQTT: Topic='{topic}', Payload='{payload}'");
        // Never blocks: fails with `TryRequest` while the queue is full.
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.as_bytes())
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        if let Err(err) = self.client.try_disconnect() {
            log::debug!("MQTT disconnect failed: {err}");
        }
    }
}
