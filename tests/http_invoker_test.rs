//! Integration tests for the HTTP reasoning invoker
//!
//! Tests request shape and error mapping using wiremock for request/response mocking.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{body_partial_json, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use lag_rcr_engine::config::{ControllerConfig, InvokerConfig};
use lag_rcr_engine::decomposition::NodeId;
use lag_rcr_engine::error::InvokeError;
use lag_rcr_engine::orchestrator::{
    invoke_with_retry, ContextSnippet, HttpInvoker, InvocationFailure, PromptContext, QueryBreaker,
    ReasoningInvoker, RetryPolicy,
};
use lag_rcr_engine::router::Role;

/// Create a test invoker pointing to mock server
fn create_test_invoker(base_url: &str) -> HttpInvoker {
    let config = InvokerConfig {
        base_url: Some(base_url.to_string()),
        api_key: Some("test-api-key".to_string()),
        timeout_ms: 5000,
    };
    HttpInvoker::new(&config).expect("Failed to create invoker")
}

fn prompt() -> PromptContext {
    PromptContext {
        node: NodeId(1),
        question: "What is the capital of France?".to_string(),
        context: vec![ContextSnippet {
            id: "m1".to_string(),
            content: "Paris is the capital of France.".to_string(),
        }],
        prior_outputs: BTreeMap::new(),
        temperature: 0.0,
        seed: 7,
    }
}

#[cfg(test)]
mod invoke_tests {
    use super::*;

    #[tokio::test]
    async fn test_invoke_success() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/invoke"))
            .and(header("Authorization", "Bearer test-api-key"))
            .and(body_partial_json(json!({"role": "solver", "seed": 7})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "text": "Paris",
                "confidence": 0.92
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let invoker = create_test_invoker(&mock_server.uri());
        let output = invoker.invoke(Role::Solver, &prompt()).await.unwrap();

        assert_eq!(output.text, "Paris");
        assert!((output.confidence - 0.92).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_prompt_carries_context() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/invoke"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "ok"})))
            .mount(&mock_server)
            .await;

        let invoker = create_test_invoker(&mock_server.uri());
        invoker.invoke(Role::Retriever, &prompt()).await.unwrap();

        let requests = mock_server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let user = body["messages"][1]["content"].as_str().unwrap();
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(user.contains("[m1] Paris is the capital of France."));
    }

    #[tokio::test]
    async fn test_missing_confidence_defaults_and_clamps() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_partial_json(json!({"role": "planner"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "plan"})))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"role": "critic"})))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"text": "sure", "confidence": 3.0})),
            )
            .mount(&mock_server)
            .await;

        let invoker = create_test_invoker(&mock_server.uri());
        let planned = invoker.invoke(Role::Planner, &prompt()).await.unwrap();
        let critiqued = invoker.invoke(Role::Critic, &prompt()).await.unwrap();

        assert_eq!(planned.confidence, 0.5);
        assert_eq!(critiqued.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_trailing_slash_is_trimmed() {
        let invoker = create_test_invoker("http://localhost:9999/");
        assert_eq!(invoker.base_url(), "http://localhost:9999");
    }

    #[test]
    fn test_missing_base_url_is_rejected() {
        let config = InvokerConfig {
            base_url: None,
            api_key: None,
            timeout_ms: 1000,
        };
        assert!(HttpInvoker::new(&config).is_err());
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[tokio::test]
    async fn test_server_error_maps_to_api_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/v1/invoke"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .mount(&mock_server)
            .await;

        let invoker = create_test_invoker(&mock_server.uri());
        let err = invoker.invoke(Role::Solver, &prompt()).await.unwrap_err();

        match err {
            InvokeError::Api { status, message } => {
                assert_eq!(status, 500);
                assert!(message.contains("Internal Server Error"));
            }
            other => panic!("Expected Api error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_invalid_response() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock_server)
            .await;

        let invoker = create_test_invoker(&mock_server.uri());
        let err = invoker.invoke(Role::Solver, &prompt()).await.unwrap_err();

        assert!(matches!(err, InvokeError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_retry_recovers_after_transient_failure() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"text": "Paris"})))
            .mount(&mock_server)
            .await;

        let invoker: Arc<dyn ReasoningInvoker> = Arc::new(create_test_invoker(&mock_server.uri()));
        let config = ControllerConfig {
            max_retries: 2,
            retry_delay_ms: 1,
            max_retry_delay_ms: 5,
            ..ControllerConfig::default()
        };
        let breaker = QueryBreaker::new(&config);
        let mut retries = Vec::new();

        let (output, attempts) = invoke_with_retry(
            invoker.as_ref(),
            Role::Solver,
            &prompt(),
            &RetryPolicy::from_config(&config),
            &breaker,
            &CancellationToken::new(),
            |retry, _, _| retries.push(retry),
        )
        .await
        .unwrap();

        assert_eq!(output.text, "Paris");
        assert_eq!(attempts, 2);
        assert_eq!(retries, vec![1]);
        assert_eq!(breaker.steps_used(), 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(2)
            .mount(&mock_server)
            .await;

        let invoker = create_test_invoker(&mock_server.uri());
        let config = ControllerConfig {
            max_retries: 1,
            retry_delay_ms: 1,
            max_retry_delay_ms: 1,
            ..ControllerConfig::default()
        };

        let result = invoke_with_retry(
            &invoker,
            Role::Verifier,
            &prompt(),
            &RetryPolicy::from_config(&config),
            &QueryBreaker::new(&config),
            &CancellationToken::new(),
            |_, _, _| {},
        )
        .await;

        match result {
            Err(InvocationFailure::Exhausted { attempts, error }) => {
                assert_eq!(attempts, 2);
                assert!(matches!(error, InvokeError::Unavailable { .. }));
            }
            other => panic!("Expected exhausted retries, got {:?}", other.map(|(o, _)| o)),
        }
    }
}
