use crate::error::AppError;
use crate::service::RouterService;
use crate::ui::app::{AppState, KeyAction};
use chrono::Utc;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use crossterm::ExecutableCommand;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::Line;
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table, Wrap};
use ratatui::Terminal;
use std::io;
use std::time::{Duration as StdDuration, Instant};

const COLOR_ACCENT: Color = Color::Cyan;
const COLOR_INFO: Color = Color::Green;
const COLOR_WARN: Color = Color::Yellow;
const COLOR_ALERT: Color = Color::Red;
const COLOR_MUTED: Color = Color::DarkGray;
const COLOR_HEADER: Color = Color::White;

pub async fn run_tui(service: &RouterService) -> Result<(), AppError> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    stdout.execute(EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let loop_result = run_loop(&mut terminal, service).await;

    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    loop_result
}

async fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    service: &RouterService,
) -> Result<(), AppError> {
    let mut state = AppState {
        backends: service.backend_names(),
        alert_threshold: service.monitor().limits().alert_threshold,
        ..AppState::default()
    };
    let tick_rate = StdDuration::from_secs(service.config().refresh_seconds.max(5));
    let mut last_tick = Instant::now();

    refresh_dashboard(&mut state, service).await;

    while state.running {
        terminal.draw(|f| render(f, &state))?;

        let timeout = tick_rate
            .checked_sub(last_tick.elapsed())
            .unwrap_or_else(|| StdDuration::from_millis(0));

        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                let action = match key.code {
                    KeyCode::Char(c) => state.on_key(c),
                    KeyCode::Esc => state.on_key('q'),
                    _ => KeyAction::None,
                };
                if action == KeyAction::Refresh {
                    refresh_dashboard(&mut state, service).await;
                    last_tick = Instant::now();
                }
            }
        }

        if last_tick.elapsed() >= tick_rate {
            refresh_dashboard(&mut state, service).await;
            last_tick = Instant::now();
        }
    }

    Ok(())
}

async fn refresh_dashboard(state: &mut AppState, service: &RouterService) {
    state.status = "refreshing...".into();
    let report = match service.report(state.window).await {
        Ok(report) => report,
        Err(err) => {
            state.status = format!("refresh failed: {err}");
            return;
        }
    };
    state.view.tokens = report.summary.tokens_total;
    state.view.cost = report.summary.cost_total;
    state.view.backend_breakdown = report.summary.by_backend;
    state.view.model_breakdown = report.summary.by_model;

    match service.monitor().status().await {
        Ok(budget) => {
            state.status = if budget.alerts.is_empty() {
                "ok".into()
            } else {
                format!("{} budget alert(s)", budget.alerts.len())
            };
            state.view.budget = Some(budget);
        }
        Err(err) => {
            state.view.budget = None;
            state.status = format!("budget unavailable: {err}");
        }
    }
    state.view.last_refresh = Utc::now().format("%H:%M:%S").to_string();
}

/// `threshold` is the alert fraction, so 0.8 turns the panel yellow at 80%.
fn pct_color(pct: f64, threshold: f64) -> Color {
    if pct >= 100.0 {
        COLOR_ALERT
    } else if pct >= threshold * 100.0 {
        COLOR_WARN
    } else {
        COLOR_INFO
    }
}

fn spend_panel(
    title: &'static str,
    spent: f64,
    budget: f64,
    pct: f64,
    threshold: f64,
) -> Paragraph<'static> {
    Paragraph::new(vec![
        Line::from(format!("${spent:.2} / ${budget:.2}")),
        Line::from(format!("{pct:.1}% used")),
    ])
    .block(Block::default().borders(Borders::ALL).title(title))
    .style(
        Style::default()
            .fg(pct_color(pct, threshold))
            .add_modifier(Modifier::BOLD),
    )
}

fn cost_table<'a>(rows: &'a [(String, f64)], label: &'a str, title: &'a str) -> Table<'a> {
    let rows = rows
        .iter()
        .map(|(name, cost)| {
            Row::new(vec![
                Cell::from(name.as_str()),
                Cell::from(format!("${cost:.4}")),
            ])
        })
        .collect::<Vec<_>>();
    Table::new(rows, [Constraint::Percentage(70), Constraint::Percentage(30)])
        .header(
            Row::new(vec![label, "Cost"]).style(
                Style::default()
                    .fg(Color::Yellow)
                    .add_modifier(Modifier::BOLD),
            ),
        )
        .block(Block::default().borders(Borders::ALL).title(title))
}

fn render(f: &mut ratatui::Frame, state: &AppState) {
    let size = f.area();
    let compact = state.compact_mode || size.width < 100;

    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(4),
            Constraint::Min(6),
            Constraint::Length(3),
        ])
        .split(size);

    let header = Paragraph::new(format!(
        " llm-router  ·  {}  ·  {}  ·  {} ",
        state.window.as_label(),
        state.status,
        state.view.last_refresh
    ))
    .block(Block::default().borders(Borders::ALL).title(" Session "))
    .style(Style::default().fg(COLOR_HEADER));
    f.render_widget(header, root[0]);

    render_kpis(f, root[1], state);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(35),
            Constraint::Percentage(35),
            Constraint::Percentage(30),
        ])
        .split(root[2]);

    let (backend_title, model_title) = if compact {
        (" Backends ", " Models ")
    } else {
        (" Cost By Backend ", " Top Models ")
    };
    f.render_widget(
        cost_table(&state.view.backend_breakdown, "Backend", backend_title),
        body[0],
    );
    f.render_widget(
        cost_table(&state.view.model_breakdown, "Model", model_title),
        body[1],
    );
    render_alerts(f, body[2], state);

    let footer = Paragraph::new("r refresh | 1/7/3 window | z compact | q quit")
        .block(Block::default().borders(Borders::ALL))
        .style(Style::default().fg(COLOR_MUTED));
    f.render_widget(footer, root[3]);
}

fn render_kpis(f: &mut ratatui::Frame, area: Rect, state: &AppState) {
    let kpis = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage(25),
            Constraint::Percentage(25),
            Constraint::Percentage(25),
            Constraint::Percentage(25),
        ])
        .split(area);

    if let Some(budget) = &state.view.budget {
        f.render_widget(
            spend_panel(
                " Daily ",
                budget.daily_spend,
                budget.daily_budget,
                budget.daily_pct,
                state.alert_threshold,
            ),
            kpis[0],
        );
        f.render_widget(
            spend_panel(
                " Monthly ",
                budget.monthly_spend,
                budget.monthly_budget,
                budget.monthly_pct,
                state.alert_threshold,
            ),
            kpis[1],
        );
    } else {
        let missing = Paragraph::new("n/a")
            .block(Block::default().borders(Borders::ALL).title(" Budget "))
            .style(Style::default().fg(COLOR_MUTED));
        f.render_widget(missing, kpis[0]);
    }

    let cost = Paragraph::new(format!("${:.4}", state.view.cost))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title(format!(" Cost {} ", state.window.as_label())),
        )
        .style(Style::default().fg(COLOR_ACCENT).add_modifier(Modifier::BOLD));
    let tokens = Paragraph::new(format!("{}", state.view.tokens))
        .block(Block::default().borders(Borders::ALL).title(" Tokens "))
        .style(Style::default().fg(COLOR_INFO).add_modifier(Modifier::BOLD));
    f.render_widget(cost, kpis[2]);
    f.render_widget(tokens, kpis[3]);
}

fn render_alerts(f: &mut ratatui::Frame, area: Rect, state: &AppState) {
    let mut lines: Vec<Line> = match &state.view.budget {
        Some(budget) if !budget.alerts.is_empty() => budget
            .alerts
            .iter()
            .map(|a| Line::styled(format!("! {a}"), Style::default().fg(COLOR_ALERT)))
            .collect(),
        Some(_) => vec![Line::styled("No budget alerts", Style::default().fg(COLOR_INFO))],
        None => vec![Line::styled("Budget status unavailable", Style::default().fg(COLOR_MUTED))],
    };
    lines.push(Line::from(""));
    lines.push(Line::styled(
        "Backends",
        Style::default().add_modifier(Modifier::BOLD),
    ));
    if state.backends.is_empty() {
        lines.push(Line::styled("none configured", Style::default().fg(COLOR_MUTED)));
    }
    for name in &state.backends {
        lines.push(Line::from(format!("· {name}")));
    }

    let panel = Paragraph::new(lines)
        .wrap(Wrap { trim: true })
        .block(Block::default().borders(Borders::ALL).title(" Alerts "));
    f.render_widget(panel, area);
}
