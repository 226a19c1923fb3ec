#![allow(clippy::unwrap_used)]
// Integration tests for `CloudManager` over the scripted transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use secrecy::ExposeSecret;
use uuid::Uuid;

use cobridge_api::cloud::models::{
    PublishRequest, RefreshResponse, SignInRequest, SignInResponse, SignUpResponse,
};
use cobridge_api::cloud::{
    ACCOUNT_PATH, DEVICE_PATH, DISCOVERY_PATH, RESOURCE_DIRECTORY_PATH, SESSION_PATH,
    TOKEN_REFRESH_PATH,
};
use cobridge_api::{Code, Method, Request, Response, ResourceLink, codec};
use cobridge_core::config::CONFIGURATION_PATH;
use cobridge_core::resource::GetHandler;
use cobridge_core::{
    CloudConfiguration, CloudManager, CloudManagerConfig, ConfigurationRepresentation,
    ConfigurationUpdate, CredentialsRecord, Device, PersistedState, ProvisioningStatus, Resource,
};

use common::{MockDialer, cbor, peer, recording_save, valid_update, wait_for_status};

// ── Helpers ─────────────────────────────────────────────────────────

const CLOUD_URL: &str = "coap://cloud.test:5683";

fn lamp() -> Device {
    let device = Device::new(Uuid::new_v4(), "lamp", ["oic.d.light"]);
    let get: GetHandler = Arc::new(|_req: &Request| Ok(Response::text(Code::CONTENT, "on")));
    device
        .add_resource(
            Resource::builder("/light")
                .resource_types(["oic.r.switch.binary"])
                .interfaces(["oic.if.a"])
                .get(get)
                .build(),
        )
        .unwrap();
    device
}

fn sign_up(token: &str, refresh: &str, expires_in: i64) -> Response {
    cbor(
        Code::CHANGED,
        &SignUpResponse {
            accesstoken: token.into(),
            uid: "user-1".into(),
            refreshtoken: refresh.into(),
            redirecturi: String::new(),
            expiresin: expires_in,
        },
    )
}

fn sign_in(expires_in: i64) -> Response {
    cbor(Code::CHANGED, &SignInResponse {
            expiresin: Some(expires_in),
        })
}

fn script_happy_path(dialer: &MockDialer) {
    dialer.respond(Method::Post, ACCOUNT_PATH, sign_up("T1", "R1", 3600));
    dialer.respond(Method::Post, SESSION_PATH, sign_in(3600));
    dialer.respond(Method::Post, RESOURCE_DIRECTORY_PATH, Response::new(Code::CHANGED));
    dialer.respond(Method::Delete, ACCOUNT_PATH, Response::new(Code::DELETED));
}

fn manager_for(device: &Device, dialer: &Arc<MockDialer>) -> CloudManager {
    let (save, _) = recording_save();
    CloudManager::new(
        device.registry(),
        Arc::clone(dialer) as Arc<dyn cobridge_api::Dialer>,
        CloudManagerConfig::default(),
        None,
        save,
    )
}

async fn registered_manager(device: &Device, dialer: &Arc<MockDialer>) -> CloudManager {
    script_happy_path(dialer);
    let manager = manager_for(device, dialer);
    manager.update_configuration(valid_update(CLOUD_URL)).unwrap();
    manager.init();
    wait_for_status(&manager, ProvisioningStatus::Registered).await;
    manager
}

// ── Lifecycle ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_disabled_cloud_makes_no_network_calls() {
    let device = lamp();
    let dialer = MockDialer::new();
    let manager = manager_for(&device, &dialer);

    manager.init();
    tokio::time::sleep(Duration::from_secs(60)).await;
    manager.close().await;

    assert_eq!(dialer.dial_count(), 0);
    assert!(dialer.requests().is_empty());
    assert_eq!(manager.status(), ProvisioningStatus::Uninitialized);
    assert!(manager.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_successful_registration() {
    let device = lamp();
    let dialer = MockDialer::new();
    let manager = registered_manager(&device, &dialer).await;

    assert!(manager.resources_published());
    assert_eq!(manager.credentials().access_token.expose_secret(), "T1");
    assert!(manager.credentials().signed_in);
    assert_eq!(manager.configuration().last_error_code, 0);
    assert_eq!(
        dialer.paths(),
        vec![ACCOUNT_PATH, SESSION_PATH, RESOURCE_DIRECTORY_PATH]
    );

    let publish: PublishRequest = dialer.requests_to(Method::Post, RESOURCE_DIRECTORY_PATH)[0]
        .decode()
        .unwrap();
    assert_eq!(publish.di, device.id().to_string());
    assert_eq!(publish.ttl, 0);
    let device_link = publish.links.iter().find(|l| l.href == DEVICE_PATH).unwrap();
    assert_eq!(device_link.anchor, format!("ocf://{}", device.id()));
    assert!(publish.links.iter().any(|l| l.href == "/light"));
    assert!(!publish.links.iter().any(|l| l.href == DISCOVERY_PATH));

    manager.close().await;
    assert!(dialer.last_connection().unwrap().done_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_sign_up_is_idempotent_once_token_held() {
    let device = lamp();
    let dialer = MockDialer::new();
    let manager = registered_manager(&device, &dialer).await;

    // Two timer ticks on a live, signed-in connection.
    tokio::time::sleep(Duration::from_secs(25)).await;
    manager.reconnect();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(dialer.requests_to(Method::Post, ACCOUNT_PATH).len(), 1);
    assert_eq!(dialer.requests_to(Method::Post, SESSION_PATH).len(), 1);
    assert_eq!(dialer.dial_count(), 1);
    assert_eq!(manager.status(), ProvisioningStatus::Registered);
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_persisted_credentials_skip_sign_up() {
    let device = lamp();
    let dialer = MockDialer::new();
    script_happy_path(&dialer);

    let mut configuration = CloudConfiguration::default();
    configuration.apply(valid_update(CLOUD_URL)).unwrap();
    configuration.provisioning_status = ProvisioningStatus::Registered;
    let persisted = PersistedState {
        configuration,
        credentials: CredentialsRecord {
            access_token: "T0".into(),
            user_id: "user-1".into(),
            refresh_token: "R0".into(),
            expires_in: -1,
            valid_until: None,
        },
    };

    let (save, _) = recording_save();
    let manager = CloudManager::new(
        device.registry(),
        Arc::clone(&dialer) as Arc<dyn cobridge_api::Dialer>,
        CloudManagerConfig::default(),
        Some(persisted),
        save,
    );
    assert_eq!(manager.status(), ProvisioningStatus::ReadyToRegister);

    manager.init();
    wait_for_status(&manager, ProvisioningStatus::Registered).await;
    assert_eq!(dialer.paths(), vec![SESSION_PATH, RESOURCE_DIRECTORY_PATH]);
    manager.close().await;
}

// ── Token handling ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_refresh_attempted_near_expiry() {
    let device = lamp();
    let dialer = MockDialer::new();
    script_happy_path(&dialer);
    dialer.respond(Method::Post, ACCOUNT_PATH, sign_up("T1", "R1", 60));
    dialer.respond(
        Method::Post,
        TOKEN_REFRESH_PATH,
        cbor(
            Code::CHANGED,
            &RefreshResponse {
                accesstoken: "T2".into(),
                refreshtoken: "R2".into(),
                expiresin: 3600,
            },
        ),
    );

    let manager = manager_for(&device, &dialer);
    manager.update_configuration(valid_update(CLOUD_URL)).unwrap();
    manager.init();
    wait_for_status(&manager, ProvisioningStatus::Registered).await;

    assert_eq!(
        dialer.paths(),
        vec![ACCOUNT_PATH, TOKEN_REFRESH_PATH, SESSION_PATH, RESOURCE_DIRECTORY_PATH]
    );
    let creds = manager.credentials();
    assert_eq!(creds.access_token.expose_secret(), "T2");
    assert_eq!(creds.refresh_token.expose_secret(), "R2");

    let session = &dialer.requests_to(Method::Post, SESSION_PATH)[0];
    let body: SignInRequest = session.decode().unwrap();
    assert_eq!(body.accesstoken, "T2");
    assert!(body.login);
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_sign_in_without_refresh_token_clears_configuration() {
    let device = lamp();
    let dialer = MockDialer::new();
    script_happy_path(&dialer);
    dialer.respond(Method::Post, ACCOUNT_PATH, sign_up("T1", "", 3600));
    dialer.respond(Method::Post, SESSION_PATH, Response::new(Code::UNAUTHORIZED));

    let manager = manager_for(&device, &dialer);
    manager.update_configuration(valid_update(CLOUD_URL)).unwrap();
    manager.init();
    wait_for_status(&manager, ProvisioningStatus::Uninitialized).await;

    let cfg = manager.configuration();
    assert!(cfg.url.is_empty());
    assert!(cfg.cloud_id.is_empty());
    assert_eq!(cfg.last_error_code, 3);
    assert!(!manager.credentials().has_access_token());
    assert!(dialer.last_connection().unwrap().done_cancelled());

    // Nothing left to connect to.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(dialer.dial_count(), 1);
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_unauthorized_sign_in_with_refresh_token_refreshes_next_attempt() {
    let device = lamp();
    let dialer = MockDialer::new();
    script_happy_path(&dialer);
    dialer.respond_once(Method::Post, SESSION_PATH, Response::new(Code::UNAUTHORIZED));
    dialer.respond(
        Method::Post,
        TOKEN_REFRESH_PATH,
        cbor(
            Code::CHANGED,
            &RefreshResponse {
                accesstoken: "T2".into(),
                refreshtoken: String::new(),
                expiresin: 3600,
            },
        ),
    );

    let manager = manager_for(&device, &dialer);
    manager.update_configuration(valid_update(CLOUD_URL)).unwrap();
    manager.init();
    wait_for_status(&manager, ProvisioningStatus::Registered).await;

    assert_eq!(
        dialer.paths(),
        vec![
            ACCOUNT_PATH,
            SESSION_PATH,
            TOKEN_REFRESH_PATH,
            SESSION_PATH,
            RESOURCE_DIRECTORY_PATH
        ]
    );
    // The failed step closed the first connection.
    assert_eq!(dialer.dial_count(), 2);
    // An empty refresh token in the reply keeps the old one.
    assert_eq!(manager.credentials().refresh_token.expose_secret(), "R1");
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_sign_up_redirect_moves_to_new_endpoint() {
    let device = lamp();
    let dialer = MockDialer::new();
    script_happy_path(&dialer);
    dialer.respond(
        Method::Post,
        ACCOUNT_PATH,
        cbor(
            Code::CHANGED,
            &SignUpResponse {
                accesstoken: "T1".into(),
                uid: "user-1".into(),
                refreshtoken: "R1".into(),
                redirecturi: "coap://edge.cloud.test:5683".into(),
                expiresin: 3600,
            },
        ),
    );

    let (save, saved) = recording_save();
    let manager = CloudManager::new(
        device.registry(),
        Arc::clone(&dialer) as Arc<dyn cobridge_api::Dialer>,
        CloudManagerConfig::default(),
        None,
        save,
    );
    manager.update_configuration(valid_update(CLOUD_URL)).unwrap();
    manager.init();
    wait_for_status(&manager, ProvisioningStatus::Registered).await;

    assert_eq!(manager.configuration().url, "coap://edge.cloud.test:5683");
    assert_eq!(
        dialer.dialed_urls(),
        vec!["coap://cloud.test:5683".to_owned(), "coap://edge.cloud.test:5683".to_owned()]
    );
    let last = saved.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.configuration.url, "coap://edge.cloud.test:5683");
    assert_eq!(last.credentials.access_token, "T1");
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_attempt_records_error_and_retries_on_tick() {
    let device = lamp();
    let dialer = MockDialer::new();
    script_happy_path(&dialer);
    dialer.respond_once(
        Method::Post,
        RESOURCE_DIRECTORY_PATH,
        Response::text(Code::INTERNAL_SERVER_ERROR, "rd down"),
    );

    let manager = manager_for(&device, &dialer);
    manager.update_configuration(valid_update(CLOUD_URL)).unwrap();
    manager.init();
    wait_for_status(&manager, ProvisioningStatus::Registered).await;

    // First attempt failed at publish; progress before it was kept.
    assert_eq!(dialer.requests_to(Method::Post, ACCOUNT_PATH).len(), 1);
    assert_eq!(dialer.requests_to(Method::Post, RESOURCE_DIRECTORY_PATH).len(), 2);
    assert_eq!(dialer.dial_count(), 2);
    assert_eq!(manager.configuration().last_error_code, 0);
    manager.close().await;
}

// ── Configuration resource ──────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_empty_url_post_resets_without_network() {
    let device = lamp();
    let dialer = MockDialer::new();
    let manager = manager_for(&device, &dialer);
    manager.update_configuration(valid_update(CLOUD_URL)).unwrap();

    let res = manager.configuration_resource();
    let req = Request::post(CONFIGURATION_PATH)
        .with_cbor(&ConfigurationUpdate {
            cis: Some(String::new()),
            ..ConfigurationUpdate::default()
        })
        .unwrap();
    let resp = res.handle(&peer("192.0.2.1:5683"), &req);

    assert_eq!(resp.code, Code::CHANGED);
    let repr: ConfigurationRepresentation = resp.decode().unwrap();
    assert_eq!(repr.cps, ProvisioningStatus::Uninitialized);
    assert_eq!(manager.status(), ProvisioningStatus::Uninitialized);

    manager.init();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(dialer.dial_count(), 0);
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_invalid_post_is_rejected_and_configuration_unchanged() {
    let device = lamp();
    let dialer = MockDialer::new();
    let manager = manager_for(&device, &dialer);
    let before = manager.configuration();

    let req = Request::post(CONFIGURATION_PATH)
        .with_cbor(&ConfigurationUpdate {
            apn: Some("github".into()),
            cis: Some(CLOUD_URL.into()),
            ..ConfigurationUpdate::default()
        })
        .unwrap();
    let resp = manager
        .configuration_resource()
        .handle(&peer("192.0.2.1:5683"), &req);

    assert_eq!(resp.code, Code::BAD_REQUEST);
    assert!(resp.text_payload().contains("sid"));
    assert_eq!(manager.configuration(), before);

    let garbage = Request {
        payload: vec![0xFF, 0x00],
        ..Request::post(CONFIGURATION_PATH)
    };
    let resp = manager
        .configuration_resource()
        .handle(&peer("192.0.2.1:5683"), &garbage);
    assert_eq!(resp.code, Code::BAD_REQUEST);
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_get_returns_current_representation() {
    let device = lamp();
    let dialer = MockDialer::new();
    let manager = manager_for(&device, &dialer);
    manager.update_configuration(valid_update(CLOUD_URL)).unwrap();

    let resp = manager
        .configuration_resource()
        .handle(&peer("192.0.2.1:5683"), &Request::get(CONFIGURATION_PATH));
    assert_eq!(resp.code, Code::CONTENT);
    let repr: ConfigurationRepresentation = resp.decode().unwrap();
    assert_eq!(repr.rt, vec!["oic.r.coapcloudconf".to_owned()]);
    assert_eq!(repr.cis, CLOUD_URL);
    assert_eq!(repr.sid, "cloud-1");
    assert_eq!(repr.apn, "github");
    assert_eq!(repr.cps, ProvisioningStatus::ReadyToRegister);
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconfiguration_signs_off_over_live_connection() {
    let device = lamp();
    let dialer = MockDialer::new();
    let manager = registered_manager(&device, &dialer).await;

    manager
        .update_configuration(valid_update("coap://other.cloud.test"))
        .unwrap();
    let mut rx = manager.watch_status();
    tokio::time::timeout(
        Duration::from_secs(60),
        rx.wait_for(|s| *s == ProvisioningStatus::Registered),
    )
    .await
    .unwrap()
    .unwrap();

    let deletes = dialer.requests_to(Method::Delete, ACCOUNT_PATH);
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].query_value("di"), Some(device.id().to_string().as_str()));
    assert_eq!(deletes[0].query_value("uid"), Some("user-1"));
    assert_eq!(dialer.requests_to(Method::Post, ACCOUNT_PATH).len(), 2);
    assert_eq!(dialer.dialed_urls().last().unwrap(), "coap://other.cloud.test");
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_sign_off_still_clears_credentials() {
    let device = lamp();
    let dialer = MockDialer::new();
    script_happy_path(&dialer);
    dialer.delay(Method::Delete, ACCOUNT_PATH, Duration::from_secs(5));
    let (save, saved) = recording_save();
    let manager = CloudManager::new(
        device.registry(),
        Arc::clone(&dialer) as Arc<dyn cobridge_api::Dialer>,
        CloudManagerConfig::default(),
        None,
        save,
    );
    manager.update_configuration(valid_update(CLOUD_URL)).unwrap();
    manager.init();
    wait_for_status(&manager, ProvisioningStatus::Registered).await;

    manager
        .update_configuration(valid_update("coap://other.cloud.test"))
        .unwrap();
    wait_for_status(&manager, ProvisioningStatus::Deregistering).await;
    manager.close().await;

    assert_eq!(dialer.requests_to(Method::Delete, ACCOUNT_PATH).len(), 1);
    assert!(!manager.credentials().has_access_token());
    assert_eq!(dialer.dial_count(), 1);
    let last = saved.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.credentials, CredentialsRecord::default());
    assert_eq!(last.configuration.url, "coap://other.cloud.test");
    assert_eq!(
        last.configuration.provisioning_status,
        ProvisioningStatus::ReadyToRegister
    );
}

// ── Inbound routing ─────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_inbound_discovery_gets_device_query_and_canonical_link() {
    let device = lamp();
    let dialer = MockDialer::new();
    let manager = registered_manager(&device, &dialer).await;
    let handler = dialer.handler().unwrap();

    let resp = handler
        .handle(peer("cloud"), Request::get(DISCOVERY_PATH))
        .await;
    assert_eq!(resp.code, Code::CONTENT);
    let links: Vec<ResourceLink> = codec::decode(&resp.payload).unwrap();
    let device_link = links.iter().find(|l| l.href == DEVICE_PATH).unwrap();
    assert_eq!(device_link.anchor, format!("ocf://{}", device.id()));

    let resp = handler.handle(peer("cloud"), Request::get("/light")).await;
    assert_eq!(resp.text_payload(), "on");

    let resp = handler.handle(peer("cloud"), Request::get("/missing")).await;
    assert_eq!(resp.code, Code::NOT_FOUND);
    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_device_enable_cloud_exposes_configuration_resource() {
    let device = lamp();
    let dialer = MockDialer::new();
    let (save, _) = recording_save();
    let manager = device
        .enable_cloud(
            Arc::clone(&dialer) as Arc<dyn cobridge_api::Dialer>,
            CloudManagerConfig::default(),
            None,
            save,
        )
        .unwrap();

    assert!(device.resource(CONFIGURATION_PATH).is_some());
    assert!(device.cloud().is_some());
    assert_eq!(manager.status(), ProvisioningStatus::Uninitialized);

    device.close().await;
    assert!(manager.is_closed());
    assert_eq!(dialer.dial_count(), 0);
}
