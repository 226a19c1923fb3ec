//! `cobridge run`: serve every configured device on one UDP endpoint.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use cobridge_api::udp::UdpEndpoint;
use cobridge_api::{Dialer, RequestHandler};
use cobridge_config::{BridgeConfig, DeviceConfig, FileStore};
use cobridge_core::{CloudManager, CloudManagerConfig, Device};

use crate::cli::{GlobalOpts, RunArgs};
use crate::error::CliError;
use crate::router::DeviceRouter;
use crate::value::value_resource;

pub async fn handle(args: RunArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let (path, mut cfg) = super::load(global)?;
    apply_overrides(&mut cfg, args);
    cfg.validate().map_err(|e| CliError::from_config(&path, e))?;
    let addr = cfg
        .runtime
        .listen_addr()
        .map_err(|e| CliError::from_config(&path, e))?;
    if cfg.devices.is_empty() {
        warn!(path = %path.display(), "no devices configured");
    }

    let devices = cfg
        .devices
        .iter()
        .map(build_device)
        .collect::<Result<Vec<_>, _>>()?;

    let router: Arc<dyn RequestHandler> = Arc::new(DeviceRouter::new(devices.clone()));
    let endpoint = UdpEndpoint::bind(addr, router)
        .await
        .map_err(|source| CliError::Bind {
            addr: addr.to_string(),
            source,
        })?;
    info!(addr = %endpoint.local_addr(), devices = devices.len(), "endpoint listening");

    let store = FileStore::new(cfg.runtime.state_dir());
    let settings = cfg.runtime.manager_config();
    let dialer: Arc<dyn Dialer> = Arc::new(endpoint.dialer());
    let mut watchers = Vec::with_capacity(devices.len());
    for (device, device_cfg) in devices.iter().zip(&cfg.devices) {
        let manager = start_cloud(device, device_cfg, &dialer, &store, settings)?;
        watchers.push(log_status(device_cfg.name.clone(), &manager));
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupted, shutting down");

    for device in &devices {
        device.close().await;
    }
    endpoint.close();
    for watcher in watchers {
        watcher.abort();
    }
    Ok(())
}

fn apply_overrides(cfg: &mut BridgeConfig, args: RunArgs) {
    if let Some(listen) = args.listen {
        cfg.runtime.listen = listen;
    }
    if let Some(dir) = args.state_dir {
        cfg.runtime.state_dir = Some(dir);
    }
}

fn build_device(cfg: &DeviceConfig) -> Result<Arc<Device>, CliError> {
    let device = Device::new(cfg.id, cfg.name.clone(), cfg.device_types.iter().cloned());
    for res in &cfg.resources {
        device
            .add_resource(value_resource(res))
            .map_err(|source| CliError::Device {
                device: cfg.name.clone(),
                source,
            })?;
    }
    Ok(Arc::new(device))
}

/// Attach the cloud manager, restoring persisted state. The `[devices.cloud]`
/// block only seeds a device that has never saved any state.
fn start_cloud(
    device: &Device,
    cfg: &DeviceConfig,
    dialer: &Arc<dyn Dialer>,
    store: &FileStore,
    settings: CloudManagerConfig,
) -> Result<CloudManager, CliError> {
    let device_error = |source| CliError::Device {
        device: cfg.name.clone(),
        source,
    };

    let persisted = store.load(&cfg.id).map_err(|source| CliError::State {
        device: cfg.name.clone(),
        source,
    })?;
    let bootstrap = if persisted.is_none() {
        cfg.cloud.as_ref()
    } else {
        None
    };

    let manager = device
        .enable_cloud(
            Arc::clone(dialer),
            settings,
            persisted,
            store.save_callback(cfg.id),
        )
        .map_err(device_error)?;
    if let Some(bootstrap) = bootstrap {
        manager
            .update_configuration(bootstrap.to_update())
            .map_err(device_error)?;
    }
    info!(device = %cfg.name, id = %cfg.id, status = %manager.status(), "device started");
    Ok(manager)
}

fn log_status(name: String, manager: &CloudManager) -> JoinHandle<()> {
    let mut rx = manager.watch_status();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let status = *rx.borrow_and_update();
            info!(device = %name, %status, "provisioning status changed");
        }
    })
}
