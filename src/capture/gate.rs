//! DeviceGate - カメラデバイスの排他制御
//!
//! ## 目的
//!
//! - カメラデバイスの多重オープンを防止（端末のカメラは同時に1つ）
//! - 先行利用が完了するまで短時間待機
//! - タイムアウト時はエラーを返す（ハードウェアロック滞留の抑制）

use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// デフォルト待機タイムアウト（5秒）
const DEFAULT_WAIT_TIMEOUT_MS: u64 = 5000;

/// DeviceGate - カメラデバイスアクセスを直列化
pub struct DeviceGate {
    /// 単一デバイススロットのロック
    lock: Arc<Mutex<()>>,
    /// 待機タイムアウト
    wait_timeout: Duration,
}

impl DeviceGate {
    /// 新規作成
    pub fn new() -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            wait_timeout: Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS),
        }
    }

    /// 待機タイムアウトを指定して作成
    pub fn with_timeout(timeout_ms: u64) -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            wait_timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// デバイスアクセスを取得（待機あり）
    ///
    /// - 他が使用中なら短時間待機
    /// - タイムアウトしたらエラー
    /// - 返却されたDeviceLeaseがDropされると自動解放
    pub async fn acquire(&self) -> Result<DeviceLease> {
        match timeout(self.wait_timeout, self.lock.clone().lock_owned()).await {
            Ok(guard) => {
                tracing::debug!("Camera device access acquired");
                Ok(DeviceLease { _guard: guard })
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.wait_timeout.as_millis(),
                    "Camera device access timeout - device busy"
                );
                Err(Error::Busy("camera device busy (timeout)".to_string()))
            }
        }
    }

    /// デバイスアクセスを試行（待機なし）
    ///
    /// - 他が使用中なら即None
    pub fn try_acquire(&self) -> Option<DeviceLease> {
        match self.lock.clone().try_lock_owned() {
            Ok(guard) => {
                tracing::debug!("Camera device access acquired (try)");
                Some(DeviceLease { _guard: guard })
            }
            Err(_) => {
                tracing::debug!("Camera device access denied - device busy");
                None
            }
        }
    }
}

impl Default for DeviceGate {
    fn default() -> Self {
        Self::new()
    }
}

/// デバイスアクセスリース - Dropで自動解放
pub struct DeviceLease {
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        tracing::debug!("Camera device access released");
    }
}
