use std::path::Path;

use plotters::prelude::*;

use crate::error::{MlpError, Result};

fn plot_error(err: impl std::fmt::Display) -> MlpError {
    MlpError::Plot(err.to_string())
}

/// Draws the training loss per epoch and, when present, the validation
/// score on a secondary axis. The file is written as SVG.
pub fn plot_loss_curve(
    path: impl AsRef<Path>,
    loss_curve: &[f64],
    validation_scores: &[f64],
) -> Result<()> {
    if loss_curve.is_empty() {
        return Err(MlpError::EmptyInput);
    }

    let root = SVGBackend::new(path.as_ref(), (800, 500)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_error)?;

    let max_loss = loss_curve.iter().copied().fold(f64::MIN, f64::max);
    let min_loss = loss_curve.iter().copied().fold(f64::MAX, f64::min);
    let margin = ((max_loss - min_loss) * 0.05).max(1e-9);
    let epochs = loss_curve.len();

    let mut chart = ChartBuilder::on(&root)
        .caption("Training loss", ("sans-serif", 24))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .right_y_label_area_size(if validation_scores.is_empty() { 0 } else { 60 })
        .build_cartesian_2d(1..epochs.max(2), (min_loss - margin)..(max_loss + margin))
        .map_err(plot_error)?
        .set_secondary_coord(1..epochs.max(2), 0.0..1.0);

    chart
        .configure_mesh()
        .x_desc("iteration")
        .y_desc("loss")
        .draw()
        .map_err(plot_error)?;

    chart
        .draw_series(LineSeries::new(
            loss_curve.iter().enumerate().map(|(i, &loss)| (i + 1, loss)),
            &BLUE,
        ))
        .map_err(plot_error)?
        .label("loss")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLUE));

    if !validation_scores.is_empty() {
        chart
            .configure_secondary_axes()
            .y_desc("validation score")
            .draw()
            .map_err(plot_error)?;
        chart
            .draw_secondary_series(LineSeries::new(
                validation_scores
                    .iter()
                    .enumerate()
                    .map(|(i, &score)| (i + 1, score.clamp(0.0, 1.0))),
                &RED,
            ))
            .map_err(plot_error)?
            .label("validation score")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RED));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()
        .map_err(plot_error)?;

    root.present().map_err(plot_error)?;
    Ok(())
}
