//! Widget layout and rendering for the workspace.

use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, Paragraph};
use ratatui::Frame;

use super::{App, Focus};

pub(crate) fn draw(frame: &mut Frame, app: &App) {
    let area = frame.size();
    let outer = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(1), Constraint::Length(1)])
        .split(area);
    let inner = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(1), Constraint::Length(app.browser_width)])
        .split(outer[0]);

    draw_output(frame, app, inner[0]);
    if app.browser_width > 0 {
        draw_browser(frame, app, inner[1]);
    }
    draw_input(frame, app, outer[1]);
    if app.focus == Focus::Input && !app.autocomplete.is_empty() {
        draw_autocomplete(frame, app, outer[1]);
    }
    if app.rename.is_some() {
        draw_rename_dialog(frame, app, area);
    }
}

fn border_style(focused: bool) -> Style {
    if focused {
        Style::default().fg(Color::Cyan)
    } else {
        Style::default().fg(Color::DarkGray)
    }
}

fn draw_output(frame: &mut Frame, app: &App, area: Rect) {
    let height = area.height.saturating_sub(2) as usize;
    let mut all: Vec<Line> = app
        .lines
        .iter()
        .map(|line| {
            if line.error {
                Line::from(Span::styled(
                    line.text.clone(),
                    Style::default().fg(Color::Red),
                ))
            } else {
                Line::from(line.text.clone())
            }
        })
        .collect();
    if !app.partial.is_empty() {
        all.push(Line::from(app.partial.clone()));
    }
    let start = all.len().saturating_sub(height + app.scroll_back);
    let visible: Vec<Line> = all.into_iter().skip(start).take(height).collect();

    let title = if app.scroll_back > 0 {
        format!(" espore (scrolled -{}) ", app.scroll_back)
    } else {
        " espore ".to_string()
    };
    let output = Paragraph::new(visible).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(border_style(app.focus == Focus::Output))
            .title(title),
    );
    frame.render_widget(output, area);
}

fn draw_browser(frame: &mut Frame, app: &App, area: Rect) {
    let mut items = Vec::with_capacity(app.files.len() + 1);
    items.push(ListItem::new(Span::styled(
        "(Refresh)",
        Style::default().fg(Color::Yellow),
    )));
    for row in &app.files {
        items.push(ListItem::new(row.name.clone()));
    }
    let items: Vec<ListItem> = items
        .into_iter()
        .enumerate()
        .map(|(i, item)| {
            if app.focus == Focus::Browser && i == app.browser_selected {
                item.style(Style::default().add_modifier(Modifier::REVERSED))
            } else {
                item
            }
        })
        .collect();
    let list = List::new(items).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(border_style(app.focus == Focus::Browser))
            .title(" files "),
    );
    frame.render_widget(list, area);
}

fn draw_input(frame: &mut Frame, app: &App, area: Rect) {
    let style = if app.focus == Focus::Input {
        Style::default()
    } else {
        Style::default().fg(Color::DarkGray)
    };
    let prompt = Line::from(vec![
        Span::styled("> ", Style::default().fg(Color::Green)),
        Span::styled(app.input.clone(), style),
    ]);
    frame.render_widget(Paragraph::new(prompt), area);
    if app.focus == Focus::Input && app.rename.is_none() {
        frame.set_cursor(area.x + 2 + app.input.len() as u16, area.y);
    }
}

fn draw_autocomplete(frame: &mut Frame, app: &App, input_area: Rect) {
    let height = app.autocomplete.len().min(6) as u16;
    if height == 0 || input_area.y < height {
        return;
    }
    let area = Rect {
        x: input_area.x + 2,
        y: input_area.y - height,
        width: 24.min(input_area.width.saturating_sub(2)),
        height,
    };
    let items: Vec<ListItem> = app
        .autocomplete
        .iter()
        .enumerate()
        .take(height as usize)
        .map(|(i, cmd)| {
            let item = ListItem::new(cmd.clone());
            if i == app.autocomplete_idx {
                item.style(Style::default().add_modifier(Modifier::REVERSED))
            } else {
                item.style(Style::default().bg(Color::DarkGray))
            }
        })
        .collect();
    frame.render_widget(Clear, area);
    frame.render_widget(List::new(items), area);
}

fn draw_rename_dialog(frame: &mut Frame, app: &App, area: Rect) {
    let Some(dialog) = &app.rename else { return };
    let width = 40.min(area.width);
    let height = 5.min(area.height);
    let rect = Rect {
        x: area.x + (area.width.saturating_sub(width)) / 2,
        y: area.y + (area.height.saturating_sub(height)) / 2,
        width,
        height,
    };
    let body = vec![
        Line::from(format!("New name: {}", dialog.value)),
        Line::from(""),
        Line::from(Span::styled(
            "Enter renames, Esc cancels",
            Style::default().fg(Color::DarkGray),
        )),
    ];
    let dialog_widget = Paragraph::new(body).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Yellow))
            .title(format!(" Rename {} ", dialog.target)),
    );
    frame.render_widget(Clear, rect);
    frame.render_widget(dialog_widget, rect);
}
