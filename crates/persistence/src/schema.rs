//! Database schema definitions

/// SQL to create all tables
/// NOTE: backtest results and analyses are stored as JSON text, timestamps as RFC 3339 UTC
pub const CREATE_TABLES: &str = r#"
-- Strategies under refinement
CREATE TABLE IF NOT EXISTS strategies (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    code TEXT NOT NULL,
    description TEXT,
    created_at TEXT NOT NULL,
    current_version INTEGER NOT NULL DEFAULT 1,
    qc_project_id TEXT,
    best_sharpe REAL NOT NULL DEFAULT 0,
    best_version INTEGER NOT NULL DEFAULT 1
);

-- Append-only refinement history
CREATE TABLE IF NOT EXISTS iterations (
    id TEXT PRIMARY KEY,
    strategy_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    timestamp TEXT NOT NULL,
    backtest_result TEXT NOT NULL,
    analysis TEXT NOT NULL,
    code_before TEXT NOT NULL,
    code_after TEXT NOT NULL,
    improvement REAL NOT NULL DEFAULT 0,
    FOREIGN KEY (strategy_id) REFERENCES strategies(id)
);

-- Loop configuration (single row)
CREATE TABLE IF NOT EXISTS config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    data TEXT NOT NULL
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_iterations_strategy ON iterations(strategy_id);
CREATE INDEX IF NOT EXISTS idx_iterations_timestamp ON iterations(timestamp DESC)
"#;
