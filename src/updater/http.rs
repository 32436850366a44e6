//! HTTP delivery of async updates to account and container servers.

use super::{AsyncUpdate, DeliveryResult, MetadataDelivery, UpdateOperation};
use crate::types::Device;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Sends updates as `PUT`/`DELETE /<device>/<partition>/<account>[/<container>]`
/// with the payload as request headers.
pub struct HttpDelivery {
    client: reqwest::Client,
}

impl HttpDelivery {
    pub fn new(node_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(node_timeout))
            .timeout(node_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    pub fn url(device: &Device, update: &AsyncUpdate) -> String {
        format!(
            "http://{}:{}/{}/{}{}",
            device.ip,
            device.port,
            device.name,
            update.partition,
            update.target.path()
        )
    }
}

#[async_trait]
impl MetadataDelivery for HttpDelivery {
    async fn deliver(&self, device: &Device, update: &AsyncUpdate) -> DeliveryResult {
        let url = Self::url(device, update);
        let mut request = match update.operation {
            UpdateOperation::Put => self.client.put(&url),
            UpdateOperation::Delete => self.client.delete(&url),
        };
        for (key, value) in &update.payload {
            request = request.header(key.as_str(), value.as_str());
        }

        match request.send().await {
            Ok(response) => classify(response.status()),
            Err(e) if e.is_builder() => DeliveryResult::Reject(e.to_string()),
            Err(e) => DeliveryResult::Unreachable(e.to_string()),
        }
    }
}

fn classify(status: StatusCode) -> DeliveryResult {
    if status.is_success() {
        DeliveryResult::Ack
    } else if status == StatusCode::INSUFFICIENT_STORAGE {
        // the remote device is unmounted
        DeliveryResult::Unreachable(status.to_string())
    } else {
        DeliveryResult::Reject(status.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updater::UpdateTarget;

    fn device(port: u16) -> Device {
        Device {
            id: 4,
            name: "sdc1".into(),
            ip: "127.0.0.1".into(),
            port,
            weight: 1.0,
            region: 1,
            zone: 2,
        }
    }

    #[test]
    fn test_url() {
        let update = AsyncUpdate::new(
            UpdateTarget::Container {
                account: "AUTH_test".into(),
                container: "c1".into(),
            },
            99,
            vec![],
            UpdateOperation::Put,
        );
        assert_eq!(
            HttpDelivery::url(&device(6201), &update),
            "http://127.0.0.1:6201/sdc1/99/AUTH_test/c1"
        );
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(StatusCode::CREATED), DeliveryResult::Ack);
        assert_eq!(classify(StatusCode::NO_CONTENT), DeliveryResult::Ack);
        assert!(matches!(
            classify(StatusCode::INSUFFICIENT_STORAGE),
            DeliveryResult::Unreachable(_)
        ));
        assert!(matches!(classify(StatusCode::CONFLICT), DeliveryResult::Reject(_)));
    }

    #[tokio::test]
    async fn test_closed_port_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let update = AsyncUpdate::new(
            UpdateTarget::Account {
                account: "AUTH_test".into(),
            },
            1,
            vec![device(port)],
            UpdateOperation::Put,
        );
        let delivery = HttpDelivery::new(Duration::from_secs(1));
        assert!(matches!(
            delivery.deliver(&device(port), &update).await,
            DeliveryResult::Unreachable(_)
        ));
    }
}
