#![forbid(unsafe_code)]

use poem_openapi::{payload::Json, Object, OpenApi};

// From cargo.toml.
const SBS_VERSION: Option<&str> = option_env!("CARGO_PKG_VERSION");
const SBS_PACKAGE: Option<&str> = option_env!("CARGO_PKG_NAME");

// ***************************************************************************
//                          Request/Response Definitions
// ***************************************************************************
pub struct VersionApi;

#[derive(Object)]
struct RespVersion {
    result_code: String,
    result_msg: String,
    sbs_version: String,
    package: String,
}

// ***************************************************************************
//                             OpenAPI Endpoint
// ***************************************************************************
#[OpenApi]
impl VersionApi {
    #[oai(path = "/sbs/version", method = "get")]
    async fn get_version(&self) -> Json<RespVersion> {
        Json(RespVersion::new())
    }
}

// ***************************************************************************
//                          Request/Response Methods
// ***************************************************************************
impl RespVersion {
    fn new() -> Self {
        Self {
            result_code: "0".to_string(),
            result_msg: "success".to_string(),
            sbs_version: SBS_VERSION.unwrap_or("unknown").to_string(),
            package: SBS_PACKAGE.unwrap_or("unknown").to_string(),
        }
    }
}
