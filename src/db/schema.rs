/// Schema version stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Schema for the offline database.
pub const SCHEMA: &str = r#"
-- API response payloads kept for offline use
CREATE TABLE IF NOT EXISTS data (
    url TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_data_timestamp ON data(timestamp);

-- Sales created while the backend was unreachable
CREATE TABLE IF NOT EXISTS vendas_offline (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    data TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_attempt_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_vendas_offline_timestamp ON vendas_offline(timestamp);
CREATE INDEX IF NOT EXISTS idx_vendas_offline_synced ON vendas_offline(synced);

-- Product catalog snapshot for offline lookup
CREATE TABLE IF NOT EXISTS produtos_cache (
    id INTEGER PRIMARY KEY,
    codigo_barras TEXT,
    nome_comercial TEXT,
    data TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_produtos_cache_codigo_barras ON produtos_cache(codigo_barras);
CREATE INDEX IF NOT EXISTS idx_produtos_cache_nome ON produtos_cache(nome_comercial);

-- Response cache, one generation per cache name
CREATE TABLE IF NOT EXISTS responses (
    cache_name TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at INTEGER NOT NULL,
    PRIMARY KEY (cache_name, url)
);
"#;
