//! Adapter selection at node startup.

use tracing::info;

use pvt_common::{PrivacyError, PrivacyResult, PtmError};

use crate::config::{ConnectionType, PtmConfig};
use crate::engine::tessera::retrieve_api_version;
use crate::engine::{CachingProxy, ConstellationClient, NotInUse, PrivateTransactionManager, PtmAdapter, TesseraClient};
use crate::transport::PtmClient;

/// Build the adapter for a full node.
///
/// Without a configured connection the node runs with privacy disabled. Otherwise
/// the PTM must answer `/upcheck`; a PTM without `/version` is constellation.
pub async fn connect(config: &PtmConfig) -> PrivacyResult<PtmAdapter> {
    if config.connection_type == ConnectionType::None {
        info!("Running with private transaction manager disabled - private transactions will not be supported");
        return Ok(PtmAdapter::NotInUse(NotInUse));
    }

    let client = PtmClient::from_config(config)?;
    select_adapter(client).await
}

/// Adapter for a light client, which reaches payloads through its server peer
pub fn connect_light_client() -> PtmAdapter {
    info!("Running with qlight caching proxy as private transaction manager");
    PtmAdapter::CachingProxy(CachingProxy::new())
}

async fn select_adapter(client: PtmClient) -> PrivacyResult<PtmAdapter> {
    let upcheck = client.get("/upcheck").await.map_err(connection_error)?;
    if upcheck.status != 200 {
        return Err(PtmError::NotReady.into());
    }

    let version = client.get("/version").await.map_err(connection_error)?;
    let adapter = if version.status != 200 {
        PtmAdapter::Constellation(ConstellationClient::new(client))
    } else {
        let api_version = retrieve_api_version(&client).await;
        PtmAdapter::Tessera(TesseraClient::new(client, &api_version))
    };

    info!(
        name = adapter.name(),
        distribution_version = %version.text(),
        "Target private transaction manager"
    );
    Ok(adapter)
}

fn connection_error(err: PtmError) -> PrivacyError {
    match err {
        PtmError::Transport { reason, .. } => {
            PtmError::Connection(format!("unable to connect to private tx manager due to: {}", reason)).into()
        }
        other => other.into(),
    }
}
