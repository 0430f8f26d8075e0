pub use salvo::oapi::{ToSchema, endpoint, extract::JsonBody};
pub use salvo::prelude::*;
pub use serde::{Deserialize, Serialize};

pub use crate::error::GatewayError;

pub type AppResult<T> = Result<T, GatewayError>;
pub type JsonResult<T> = Result<Json<T>, GatewayError>;

pub fn json_ok<T>(data: T) -> JsonResult<T> {
    Ok(Json(data))
}
