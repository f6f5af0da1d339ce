use std::path::Path;

/// Ordered class names; a detector's class index is a position in this list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Taxonomy {
    names: Vec<String>,
}

impl Taxonomy {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// Load from disk. `.json` files hold an array of names; anything else is
    /// read as one name per line, skipping blank lines and `#` comments.
    pub async fn load(path: &Path) -> Result<Self, TaxonomyError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| TaxonomyError::Io {
                path: path.display().to_string(),
                source,
            })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let taxonomy = if is_json {
            Self::from_json(&contents)?
        } else {
            Self::from_lines(&contents)
        };

        if taxonomy.is_empty() {
            return Err(TaxonomyError::Empty(path.display().to_string()));
        }
        Ok(taxonomy)
    }

    pub fn from_json(contents: &str) -> Result<Self, TaxonomyError> {
        let names: Vec<String> = serde_json::from_str(contents).map_err(TaxonomyError::Json)?;
        Ok(Self::new(names))
    }

    pub fn from_lines(contents: &str) -> Self {
        let names = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();
        Self::new(names)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaxonomyError {
    #[error("failed to read taxonomy file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("taxonomy file is not a JSON array of names: {0}")]
    Json(#[from] serde_json::Error),

    #[error("taxonomy file {0} lists no classes")]
    Empty(String),
}
