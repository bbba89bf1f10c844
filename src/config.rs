//! Decoder tunables.
//!
//! These are not hidden constants: capacity and stack-depth choices are
//! exposed on [`DecoderConfig`] so callers embedding this crate in a
//! fuzzer or a cut-down replay format can shrink them.

/// Maximum number of simultaneously live entities.
pub const DEFAULT_MAX_ENTITIES: usize = 20480;

/// Maximum depth of a field path's index stack.
pub const DEFAULT_FIELD_PATH_DEPTH: usize = 8;

/// Number of recent string-table names kept for substring back-references.
pub const DEFAULT_STRING_TABLE_HISTORY: usize = 32;

#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub max_entities: usize,
    pub field_path_stack_depth: usize,
    pub string_table_history: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            max_entities: DEFAULT_MAX_ENTITIES,
            field_path_stack_depth: DEFAULT_FIELD_PATH_DEPTH,
            string_table_history: DEFAULT_STRING_TABLE_HISTORY,
        }
    }
}

impl DecoderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_entities(mut self, n: usize) -> Self {
        self.max_entities = n;
        self
    }

    pub fn with_field_path_stack_depth(mut self, n: usize) -> Self {
        self.field_path_stack_depth = n;
        self
    }

    pub fn with_string_table_history(mut self, n: usize) -> Self {
        self.string_table_history = n;
        self
    }
}
