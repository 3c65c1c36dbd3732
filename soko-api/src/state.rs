use std::sync::Arc;

use soko_core::repository::TrainRepository;
use soko_shared::Masked;

use crate::control::ControlService;

#[derive(Clone)]
pub struct AppState {
    pub control: Arc<ControlService>,
    pub repo: Arc<dyn TrainRepository>,
    /// Expected value of `X-Telegram-Bot-Api-Secret-Token`.
    pub webhook_secret: Masked<String>,
}
