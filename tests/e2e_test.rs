//! End-to-end tests against a running deployment
//!
//! These tests require:
//! 1. PostgreSQL and Redis running
//! 2. Object storage reachable with the model artifacts under `models/`
//! 3. API server running on configured port
//! 4. Worker process consuming both queues
//! 5. JWT_SECRET matching the server's secret
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture
//!
//! Set API_BASE_URL to override default (http://localhost:3000)

mod helpers;

use helpers::*;
use uuid::Uuid;

/// Get base URL from env or default to localhost
fn get_base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

/// A user id no other run has used.
fn fresh_user() -> i64 {
    (Uuid::new_v4().as_u128() as i64) & i64::MAX
}

#[tokio::test]
#[ignore] // Requires running API server, worker, and all infrastructure
async fn test_e2e_health_check() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/health", base_url))
        .send()
        .await
        .expect("Health check failed");

    assert!(
        response.status().is_success(),
        "Health check returned non-success status: {}",
        response.status()
    );

    println!("✓ Health check passed");
}

#[tokio::test]
#[ignore]
async fn test_e2e_requires_token() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();

    let response = client
        .get(format!("{}/api/v1/analyses", base_url))
        .send()
        .await
        .expect("Request failed");

    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
#[ignore]
async fn test_e2e_submission_is_classified() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();
    let token = bearer_token(fresh_user(), false);

    let submitted = submit_images(
        &client,
        &base_url,
        &token,
        vec![upload("one.png"), corrupt_upload("two.png"), upload("three.png")],
        "efficientnet_b0",
        true,
    )
    .await
    .expect("Submission failed");

    assert_eq!(submitted.accepted, 2);
    assert_eq!(submitted.skipped, 1);
    assert_eq!(submitted.status, "pending");

    let analyses = wait_for_finished(&client, &base_url, &token, 2, 120)
        .await
        .expect("Jobs did not finish");

    assert_eq!(analyses.len(), 2);
    for analysis in &analyses {
        match analysis.status.as_str() {
            "succeeded" => {
                assert!(analysis.label.is_some());
                let reliability = analysis.reliability.unwrap();
                assert!((0.0..=100.0).contains(&reliability));
                println!("  ✓ {} → {:?} ({:.1})", analysis.id, analysis.label, reliability);
            }
            _ => {
                assert!(analysis.error_kind.is_some());
                println!("  ✗ {} failed: {:?}", analysis.id, analysis.error_kind);
            }
        }
        assert_eq!(analysis.waiting_position, None);
    }
}

#[tokio::test]
#[ignore]
async fn test_e2e_too_many_images_rejected() {
    let base_url = get_base_url();
    let client = reqwest::Client::new();
    let token = bearer_token(fresh_user(), false);

    let result = submit_images(
        &client,
        &base_url,
        &token,
        vec![upload("1.png"), upload("2.png"), upload("3.png"), upload("4.png")],
        "efficientnet_b0",
        false,
    )
    .await;
    assert!(result.is_err());

    let analyses = list_analyses(&client, &base_url, &token).await.unwrap();
    assert!(analyses.is_empty());
}

#[tokio::test]
#[ignore]
async fn test_e2e_concurrent_users() {
    let base_url = get_base_url();

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let base_url = base_url.clone();
        tasks.push(tokio::spawn(async move {
            let client = reqwest::Client::new();
            let token = bearer_token(fresh_user(), false);

            submit_images(&client, &base_url, &token, vec![upload("c.png")], "mobilenet_v2", false)
                .await?;
            wait_for_finished(&client, &base_url, &token, 1, 120).await
        }));
    }

    // Wait for all uploads to complete
    let results = futures::future::join_all(tasks).await;

    let mut finished = 0;
    for result in results {
        match result {
            Ok(Ok(analyses)) => {
                assert_eq!(analyses.len(), 1, "each user sees only their own job");
                finished += 1;
            }
            Ok(Err(e)) => println!("  ✗ Upload/processing error: {}", e),
            Err(e) => println!("  ✗ Task error: {}", e),
        }
    }

    assert_eq!(finished, 3);
    println!("\n  ✓ Processed {} concurrent submissions", finished);
}
