use crate::design::Sex;
use crate::margins::CellMean;
use crossterm::event::{self, Event};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::prelude::*;
use ratatui::widgets::{Axis, Block, Borders, Chart, Dataset, GraphType, Paragraph};
use std::io::{self, IsTerminal, Stdout};

/// Renders the fitted-means-by-year chart in the terminal: one line per sex,
/// dismissed on any key press. A non-interactive stdout skips the chart so
/// redirected runs stay clean.
pub fn render_means_chart(cells: &[CellMean]) -> io::Result<()> {
    if cells.is_empty() {
        return Ok(());
    }
    if !io::stdout().is_terminal() {
        log::info!("stdout is not a terminal; skipping the fitted-means chart.");
        return Ok(());
    }

    let male = series_points(cells, Sex::Male);
    let female = series_points(cells, Sex::Female);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = draw_and_wait(&mut terminal, &male, &female);

    let _ = disable_raw_mode();
    let _ = execute!(io::stdout(), LeaveAlternateScreen);
    result
}

/// The (year, fitted mean) points for one sex, in year order.
fn series_points(cells: &[CellMean], sex: Sex) -> Vec<(f64, f64)> {
    cells
        .iter()
        .filter(|cell| cell.sex == sex)
        .map(|cell| (cell.year as f64, cell.estimate.value))
        .collect()
}

fn draw_and_wait(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    male: &[(f64, f64)],
    female: &[(f64, f64)],
) -> io::Result<()> {
    let xs: Vec<f64> = male.iter().chain(female.iter()).map(|(x, _)| *x).collect();
    let ys: Vec<f64> = male.iter().chain(female.iter()).map(|(_, y)| *y).collect();
    let x_min = xs.iter().copied().fold(f64::INFINITY, f64::min);
    let x_max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let y_min = ys.iter().copied().fold(f64::INFINITY, f64::min);
    let y_max = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let window = (y_max - y_min).max(1.0);

    terminal.draw(|f| {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(10), Constraint::Length(3)])
            .split(f.area());

        let datasets = vec![
            Dataset::default()
                .name("male")
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(Color::Cyan))
                .data(male),
            Dataset::default()
                .name("female")
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(Color::Magenta))
                .data(female),
        ];

        let chart = Chart::new(datasets)
            .block(
                Block::default()
                    .title("Fitted mean expenditure by year")
                    .borders(Borders::ALL),
            )
            .x_axis(
                Axis::default()
                    .title("Survey year")
                    .bounds([x_min - 0.5, x_max + 0.5])
                    .labels(vec![
                        Line::from(format!("{x_min:.0}")),
                        Line::from(format!("{x_max:.0}")),
                    ]),
            )
            .y_axis(
                Axis::default()
                    .title("Mean expenditure")
                    .bounds([y_min - window * 0.1, y_max + window * 0.1])
                    .labels(vec![
                        Line::from(format!("{y_min:.0}")),
                        Line::from(format!("{y_max:.0}")),
                    ]),
            );
        f.render_widget(chart, chunks[0]);

        let hint = Paragraph::new("Press any key to close")
            .block(Block::default().borders(Borders::ALL))
            .style(Style::default().fg(Color::DarkGray));
        f.render_widget(hint, chunks[1]);
    })?;

    loop {
        if let Event::Key(_) = event::read()? {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::Estimate;

    fn cell(sex: Sex, year: u16, value: f64) -> CellMean {
        CellMean {
            sex,
            year,
            estimate: Estimate {
                value,
                se: 1.0,
                lo: value - 2.0,
                hi: value + 2.0,
            },
        }
    }

    #[test]
    fn series_split_by_sex_in_year_order() {
        let cells = vec![
            cell(Sex::Male, 2016, 4000.0),
            cell(Sex::Female, 2016, 4800.0),
            cell(Sex::Male, 2017, 4100.0),
            cell(Sex::Female, 2017, 5000.0),
        ];
        assert_eq!(
            series_points(&cells, Sex::Male),
            vec![(2016.0, 4000.0), (2017.0, 4100.0)]
        );
        assert_eq!(
            series_points(&cells, Sex::Female),
            vec![(2016.0, 4800.0), (2017.0, 5000.0)]
        );
    }
}
