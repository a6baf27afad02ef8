use crate::service::HealthCheckService;

#[derive(Clone)]
pub struct AppState {
    pub service: HealthCheckService,
}
