use axum::http::StatusCode;
use keel_common::rpc::RpcError;
use serde_json::json;

pub fn handle_error(err: RpcError) -> (StatusCode, axum::Json<serde_json::Value>) {
    let status =
        StatusCode::from_u16(err.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let msg = axum::Json(json!({ "code": err.code, "message": err.message }));
    (status, msg)
}

#[cfg(test)]
mod tests {
    use keel_common::rpc::ApiCode;

    use super::*;

    #[test]
    fn maps_code_to_status() {
        let (status, body) = handle_error(RpcError::permission_denied("nope"));
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body.0["code"], "PERMISSION_DENIED");
        assert_eq!(body.0["message"], "nope");

        let (status, _) = handle_error(RpcError::new(ApiCode::Unavailable, "retry"));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
