//! Session-plan driver end-to-end test (scripted charging session).

mod common;

use serde_json::json;

use common::{Behavior, MockCsms};
use fake_charging_station::{execute_session_plan, SessionPlanRequest};

#[tokio::test]
async fn scripted_session_walks_the_connector_through_a_full_charge() {
    let mock = MockCsms::spawn(Behavior::default()).await;

    let request: SessionPlanRequest = serde_json::from_value(json!({
        "cs_id": "fake_v16_station",
        "vendor": "Foo",
        "model": "Bar-42",
        "ws_url": mock.ws_url(),
        "password": "9TaK9aKGaDaaaNaN",
        "steps": [
            ["wait", 1],
            ["plugin", 1, "1234"],
            ["charge", 1, 500],
            ["wait", 2],
            ["somersault", 1],
            ["status"],
            ["stop", 1],
            ["unplug", 1],
            ["disconnect"],
        ],
    }))
    .unwrap();

    execute_session_plan(request)
        .await
        .expect("session plan should run to completion");

    // Boot burst, plug in, post-start settle, charge, stop, unplug.
    assert_eq!(
        mock.status_sequence(),
        vec![
            "Available",
            "Preparing",
            "Preparing",
            "Charging",
            "Finishing",
            "Available",
        ]
    );

    let starts = mock.calls("StartTransaction");
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0]["idTag"], "1234");

    let stops = mock.calls("StopTransaction");
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0]["transactionId"], 7);
    assert_eq!(stops[0]["idTag"], "1234");

    mock.wait_closed().await;
}

#[tokio::test]
async fn session_plan_against_a_refusing_csms_reports_boot_denial() {
    let mock = MockCsms::spawn(Behavior {
        boot_status: "Rejected",
        ..Behavior::default()
    })
    .await;

    let request: SessionPlanRequest = serde_json::from_value(json!({
        "cs_id": "fake_v16_station",
        "vendor": "Foo",
        "model": "Bar-42",
        "ws_url": mock.ws_url(),
        "password": "pw",
        "steps": [["wait", 1]],
    }))
    .unwrap();

    let err = execute_session_plan(request).await.unwrap_err();
    assert_eq!(err.to_string(), "BootNotification was not accepted by the CSMS");
}
