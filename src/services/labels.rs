use std::path::Path;

use crate::models::detection::Detection;
use crate::models::taxonomy::Taxonomy;

/// Parse a detector label file: one `classIndex cx cy width height` line per
/// object. Trailing columns (e.g. a confidence score) are ignored and blank
/// lines skipped.
pub fn parse_labels(contents: &str, taxonomy: &Taxonomy) -> Result<Vec<Detection>, LabelError> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| parse_line(index + 1, line, taxonomy))
        .collect()
}

fn parse_line(line_no: usize, line: &str, taxonomy: &Taxonomy) -> Result<Detection, LabelError> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return Err(LabelError::Malformed {
            line: line_no,
            reason: format!("expected 5 fields, found {}", fields.len()),
        });
    }

    let class_index: usize = fields[0].parse().map_err(|_| LabelError::Malformed {
        line: line_no,
        reason: format!("class index {:?} is not a non-negative integer", fields[0]),
    })?;
    let class_name = taxonomy
        .name(class_index)
        .ok_or(LabelError::UnknownClass {
            line: line_no,
            index: class_index,
            known: taxonomy.len(),
        })?;

    // Normalized to the image size, so anything outside [0, 1] is corrupt.
    let coordinate = |position: usize, name: &str| -> Result<f64, LabelError> {
        let value: f64 = fields[position].parse().map_err(|_| LabelError::Malformed {
            line: line_no,
            reason: format!("{name} {:?} is not a number", fields[position]),
        })?;
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(LabelError::Malformed {
                line: line_no,
                reason: format!("{name} {value} is outside [0, 1]"),
            });
        }
        Ok(value)
    };

    Ok(Detection {
        class_name: class_name.to_string(),
        cx: coordinate(1, "cx")?,
        cy: coordinate(2, "cy")?,
        width: coordinate(3, "width")?,
        height: coordinate(4, "height")?,
    })
}

/// Read and parse a label file. A missing file means nothing was detected.
pub async fn read_labels(
    path: Option<&Path>,
    taxonomy: &Taxonomy,
) -> Result<Vec<Detection>, LabelError> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };

    match tokio::fs::read_to_string(path).await {
        Ok(contents) => parse_labels(&contents, taxonomy),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(LabelError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LabelError {
    #[error("label line {line} is malformed: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("label line {line} uses class index {index}, taxonomy has {known} classes")]
    UnknownClass { line: usize, index: usize, known: usize },

    #[error("failed to read label file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coco() -> Taxonomy {
        Taxonomy::new(vec!["person".into(), "bicycle".into(), "car".into()])
    }

    #[test]
    fn parses_single_detection() {
        let detections = parse_labels("0 0.5 0.5 0.2 0.3\n", &coco()).unwrap();
        assert_eq!(
            detections,
            vec![Detection {
                class_name: "person".into(),
                cx: 0.5,
                cy: 0.5,
                width: 0.2,
                height: 0.3,
            }]
        );
    }

    #[test]
    fn keeps_file_order_and_ignores_confidence_column() {
        let detections = parse_labels(
            "2 0.1 0.2 0.3 0.4 0.91\n\n0 0.6 0.6 0.1 0.1 0.55\n",
            &coco(),
        )
        .unwrap();
        let classes: Vec<&str> = detections.iter().map(|d| d.class_name.as_str()).collect();
        assert_eq!(classes, vec!["car", "person"]);
    }

    #[test]
    fn unknown_class_index_is_an_error() {
        let err = parse_labels("7 0.5 0.5 0.2 0.3", &coco()).unwrap_err();
        assert!(matches!(err, LabelError::UnknownClass { line: 1, index: 7, known: 3 }));
    }

    #[test]
    fn short_line_is_malformed() {
        let err = parse_labels("0 0.5 0.5\n", &coco()).unwrap_err();
        assert!(matches!(err, LabelError::Malformed { line: 1, .. }));
    }

    #[test]
    fn non_numeric_coordinate_is_malformed() {
        let err = parse_labels("0 0.5 0.5 0.2 0.3\n1 x 0.5 0.2 0.3", &coco()).unwrap_err();
        assert!(matches!(err, LabelError::Malformed { line: 2, .. }));
    }

    #[test]
    fn non_finite_or_out_of_range_coordinate_is_malformed() {
        for line in [
            "0 nan 0.5 0.2 0.3",
            "0 0.5 inf 0.2 0.3",
            "0 0.5 0.5 -0.1 0.3",
            "0 0.5 0.5 0.2 1.5",
        ] {
            let err = parse_labels(line, &coco()).unwrap_err();
            assert!(matches!(err, LabelError::Malformed { line: 1, .. }), "{line}");
        }
        assert!(parse_labels("0 0 1 1 0", &coco()).is_ok());
    }

    #[tokio::test]
    async fn missing_file_means_no_detections() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("labels").join("cat.txt");

        assert!(read_labels(Some(&absent), &coco()).await.unwrap().is_empty());
        assert!(read_labels(None, &coco()).await.unwrap().is_empty());
    }
}
