use super::handlers::status_for;
use super::*;
use crate::branch_manager::{BranchError, ErrorKind};
use crate::domain::{BranchName, NameError, ProjectName};
use axum::http::StatusCode;
use axum::response::IntoResponse;

#[test]
fn test_init_request_defaults_proxy_port() {
    let req: InitProjectRequest = serde_json::from_str(r#"{"name": "p1"}"#).unwrap();
    assert_eq!(req.name, "p1");
    assert!(req.proxy_port.is_none());

    let req: InitProjectRequest =
        serde_json::from_str(r#"{"name": "p1", "proxy_port": 15432}"#).unwrap();
    assert_eq!(req.proxy_port, Some(15432));
}

#[test]
fn test_create_request_source_is_optional() {
    let req: CreateBranchRequest = serde_json::from_str(r#"{"name": "b1"}"#).unwrap();
    assert!(req.source.is_none());
    let req: CreateBranchRequest =
        serde_json::from_str(r#"{"name": "b2", "source": "b1"}"#).unwrap();
    assert_eq!(req.source.as_deref(), Some("b1"));
}

#[test]
fn test_status_by_kind() {
    assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
    assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
    assert_eq!(status_for(ErrorKind::State), StatusCode::CONFLICT);
    assert_eq!(
        status_for(ErrorKind::ResourceExhausted),
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(status_for(ErrorKind::Dependency), StatusCode::BAD_GATEWAY);
    assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(status_for(ErrorKind::InvalidInput), StatusCode::BAD_REQUEST);
    assert_eq!(
        status_for(ErrorKind::Internal),
        StatusCode::INTERNAL_SERVER_ERROR
    );
}

#[test]
fn test_api_error_into_response() {
    let p1 = ProjectName::new("p1").unwrap();

    let error = ApiError::Branch(BranchError::ProjectNotFound(p1.clone()));
    assert_eq!(error.into_response().status(), StatusCode::NOT_FOUND);

    let error = ApiError::Branch(BranchError::ActiveBranch {
        project: p1,
        branch: BranchName::main(),
    });
    assert_eq!(error.into_response().status(), StatusCode::CONFLICT);

    let error = ApiError::Branch(BranchError::PortExhausted {
        min: 7000,
        max: 7001,
    });
    assert_eq!(
        error.into_response().status(),
        StatusCode::SERVICE_UNAVAILABLE
    );

    let invalid: NameError = ProjectName::new("").unwrap_err();
    let error = ApiError::InvalidName(invalid);
    assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);
}

#[test]
fn test_routes_creates_valid_router() {
    let _router = routes();
}
