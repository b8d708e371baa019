//! Score extraction and threshold evaluation over a Lighthouse report

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CiError, CiResult};

/// The parts of a Lighthouse report this service reads
#[derive(Debug, Clone, Deserialize)]
pub struct LighthouseReport {
    #[serde(rename = "lighthouseVersion", default)]
    pub lighthouse_version: Option<String>,
    pub categories: BTreeMap<String, Category>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Category {
    #[serde(default)]
    pub title: Option<String>,
    /// 0.0 to 1.0; null when the category could not be scored
    #[serde(default)]
    pub score: Option<f64>,
}

impl LighthouseReport {
    pub fn from_value(value: serde_json::Value) -> CiResult<Self> {
        serde_json::from_value(value).map_err(|e| CiError::MalformedReport(e.to_string()))
    }

    /// Category id to score on the 0-100 scale
    pub fn scores(&self) -> BTreeMap<String, f64> {
        self.categories
            .iter()
            .map(|(id, category)| (id.clone(), category.score.unwrap_or(0.0) * 100.0))
            .collect()
    }
}

/// Pass/fail verdict for a commit status
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub passing: bool,
    pub description: String,
}

/// Compare scores with per-category minimums. Categories without a threshold
/// never fail the run.
pub fn evaluate(scores: &BTreeMap<String, f64>, thresholds: &BTreeMap<String, u32>) -> Evaluation {
    let mut passing = true;
    let mut required = Vec::new();

    for (category, score) in scores {
        if let Some(min) = thresholds.get(category) {
            if f64::from(*min) > score.round() {
                passing = false;
            }
            required.push(format!("{}:{}", category, min));
        }
    }

    let description = if passing {
        "Passed. Lighthouse scores meet thresholds.".to_string()
    } else {
        format!("Failed. Required scores: {}.", required.join(","))
    };

    Evaluation {
        passing,
        description,
    }
}

/// Markdown body for the pull request comment
pub fn comment_body(report: &LighthouseReport, thresholds: &BTreeMap<String, u32>) -> String {
    let mut rows = String::new();
    for (id, category) in &report.categories {
        let title = category.title.as_deref().unwrap_or(id);
        let score = (category.score.unwrap_or(0.0) * 100.0).round();
        let threshold = thresholds
            .get(id)
            .map(|min| min.to_string())
            .unwrap_or_else(|| "-".to_string());
        rows.push_str(&format!("| {} | {} | {} |\n", title, score, threshold));
    }

    format!(
        "Updated [Lighthouse](https://developers.google.com/web/tools/lighthouse/) report for the changes in this PR:\n\n\
         | Category | New score | Required threshold |\n\
         | ------------- | ------------- | ------------- |\n\
         {}\n\
         _Tested with Lighthouse version: {}_",
        rows,
        report.lighthouse_version.as_deref().unwrap_or("unknown")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report() -> LighthouseReport {
        LighthouseReport::from_value(json!({
            "lighthouseVersion": "2.9.1",
            "categories": {
                "performance": {"id": "performance", "title": "Performance", "score": 0.874},
                "seo": {"id": "seo", "title": "SEO", "score": 1.0},
                "pwa": {"id": "pwa", "title": "Progressive Web App", "score": null}
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_scores_scale_to_hundred() {
        let scores = report().scores();
        assert_eq!(scores["seo"], 100.0);
        assert_eq!(scores["pwa"], 0.0);
        assert!((scores["performance"] - 87.4).abs() < 1e-9);
    }

    #[test]
    fn test_evaluate_rounds_before_comparing() {
        let scores = report().scores();

        let thresholds = BTreeMap::from([("performance".to_string(), 87)]);
        let evaluation = evaluate(&scores, &thresholds);
        assert!(evaluation.passing);
        assert_eq!(evaluation.description, "Passed. Lighthouse scores meet thresholds.");

        let thresholds = BTreeMap::from([
            ("performance".to_string(), 90),
            ("seo".to_string(), 100),
        ]);
        let evaluation = evaluate(&scores, &thresholds);
        assert!(!evaluation.passing);
        assert_eq!(
            evaluation.description,
            "Failed. Required scores: performance:90,seo:100."
        );
    }

    #[test]
    fn test_unknown_threshold_categories_are_ignored() {
        let thresholds = BTreeMap::from([("accessibility".to_string(), 100)]);
        assert!(evaluate(&report().scores(), &thresholds).passing);
    }

    #[test]
    fn test_comment_body_table() {
        let thresholds = BTreeMap::from([("seo".to_string(), 95)]);
        let body = comment_body(&report(), &thresholds);
        assert!(body.contains("| Category | New score | Required threshold |"));
        assert!(body.contains("| Performance | 87 | - |"));
        assert!(body.contains("| SEO | 100 | 95 |"));
        assert!(body.ends_with("_Tested with Lighthouse version: 2.9.1_"));
    }

    #[test]
    fn test_report_without_categories_is_malformed() {
        let err = tokio_test::assert_err!(LighthouseReport::from_value(json!({"lighthouseVersion": "1"})));
        assert!(matches!(err, CiError::MalformedReport(_)));
    }
}
