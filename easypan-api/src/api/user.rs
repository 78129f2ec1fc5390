use crate::client::{Client, RequestOptions};
use crate::error::{ApiError, ApiResult};
use crate::models::user::*;
use async_trait::async_trait;

/// Account API methods
#[async_trait]
pub trait UserApi: Send + Sync {
    /// Get storage usage of the current account
    async fn get_use_space(&self) -> ApiResult<UseSpace>;
}

#[async_trait]
impl UserApi for Client {
    async fn get_use_space(&self) -> ApiResult<UseSpace> {
        let space: Option<UseSpace> = self
            .post_form("/getUseSpace", &[] as &[(&str, &str)], RequestOptions::new())
            .await?;
        space.ok_or_else(|| ApiError::Other("API returned success but no data".to_string()))
    }
}
