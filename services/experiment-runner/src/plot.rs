use std::path::Path;

use anyhow::Result;
use plotters::prelude::*;

use federa_core::Performance;

/// Accuracy curve per test organization across rounds, written as SVG.
pub fn plot_performances(performances: &[Performance], path: &Path) -> Result<bool> {
    if performances.is_empty() {
        return Ok(false);
    }
    let mut curves: Vec<(&str, Vec<(f64, f64)>)> = Vec::new();
    for p in performances {
        let point = (p.round_idx as f64, p.performance);
        match curves.iter_mut().find(|(w, _)| *w == p.worker) {
            Some((_, points)) => points.push(point),
            None => curves.push((p.worker.as_str(), vec![point])),
        }
    }
    let last_round = performances.iter().map(|p| p.round_idx).max().unwrap_or(1) as f64;

    let root = SVGBackend::new(path, (800, 480)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Test accuracy per round", ("sans-serif", 24).into_font())
        .margin(16)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0.5f64..last_round + 0.5, 0f64..1f64)?;
    chart.configure_mesh().x_desc("round").y_desc("accuracy").draw()?;

    for (i, (worker, points)) in curves.into_iter().enumerate() {
        let color = Palette99::pick(i).to_rgba();
        chart
            .draw_series(LineSeries::new(points, color.stroke_width(2)))?
            .label(worker)
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
    }
    chart.configure_series_labels().background_style(WHITE.mix(0.8)).border_style(BLACK).draw()?;
    root.present()?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perf(worker: &str, round_idx: u64, performance: f64) -> Performance {
        Performance { worker: worker.into(), round_idx, metric_key: "acc".into(), performance }
    }

    #[test]
    fn one_curve_per_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("performance.svg");
        let perfs = vec![perf("org-1", 1, 0.4), perf("org-2", 1, 0.5), perf("org-1", 2, 0.7), perf("org-2", 2, 0.8)];
        assert!(plot_performances(&perfs, &path).unwrap());
        let svg = std::fs::read_to_string(&path).unwrap();
        assert!(svg.contains("org-1") && svg.contains("org-2"));
    }

    #[test]
    fn nothing_written_without_performances() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("performance.svg");
        assert!(!plot_performances(&[], &path).unwrap());
        assert!(!path.exists());
    }
}
