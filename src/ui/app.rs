use crate::budget::{BudgetStatus, DEFAULT_ALERT_THRESHOLD};
use crate::models::TimeWindow;

#[derive(Debug, Clone)]
pub struct DashboardView {
    pub tokens: u64,
    pub cost: f64,
    pub backend_breakdown: Vec<(String, f64)>,
    pub model_breakdown: Vec<(String, f64)>,
    pub budget: Option<BudgetStatus>,
    pub last_refresh: String,
}

impl Default for DashboardView {
    fn default() -> Self {
        Self {
            tokens: 0,
            cost: 0.0,
            backend_breakdown: vec![],
            model_breakdown: vec![],
            budget: None,
            last_refresh: "never".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    None,
    Refresh,
    Quit,
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub running: bool,
    pub window: TimeWindow,
    pub status: String,
    pub compact_mode: bool,
    pub view: DashboardView,
    pub backends: Vec<String>,
    pub alert_threshold: f64,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            running: true,
            window: TimeWindow::OneDay,
            status: "ready".into(),
            compact_mode: false,
            view: DashboardView::default(),
            backends: vec![],
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
        }
    }
}

impl AppState {
    pub fn on_key(&mut self, key: char) -> KeyAction {
        let window = match key {
            'q' => {
                self.running = false;
                return KeyAction::Quit;
            }
            'r' => return KeyAction::Refresh,
            'z' => {
                self.compact_mode = !self.compact_mode;
                return KeyAction::None;
            }
            '1' => TimeWindow::OneDay,
            '7' => TimeWindow::SevenDays,
            '3' => TimeWindow::ThirtyDays,
            _ => return KeyAction::None,
        };
        if window == self.window {
            return KeyAction::None;
        }
        self.window = window;
        KeyAction::Refresh
    }
}
