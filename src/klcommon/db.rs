use crate::klcommon::config::DatabaseConfig;
use crate::klcommon::error::{AppError, Result};
use crate::klcommon::models::Candlestick;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// 数据库日志目标
pub const DB_TARGET: &str = "db";

// 数据库连接池类型
pub type DbPool = Pool<SqliteConnectionManager>;

/// 已完成K线的持久化端
///
/// 聚合链路对每个收线只调用一次 `store`，失败的重试与否由实现者自己决定。
pub trait CandlestickSink: Send + Sync {
    fn store(&self, symbol: &str, candlestick: &Candlestick) -> Result<()>;
}

/// SQLite 数据库
pub struct Database {
    pool: DbPool,
    insert_count: AtomicU64,
}

impl Database {
    /// 以默认参数打开（或创建）数据库文件
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let config = DatabaseConfig {
            database_path: db_path.as_ref().display().to_string(),
            ..DatabaseConfig::default()
        };
        Self::with_config(&config)
    }

    #[instrument(target = "db", skip_all, fields(db_path = %config.database_path), err)]
    pub fn with_config(config: &DatabaseConfig) -> Result<Self> {
        let db_path = Path::new(&config.database_path);

        // Ensure parent directory exists for database
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!(target: DB_TARGET, log_type = "module", "Using SQLite database at {}", db_path.display());

        let enable_wal = config.enable_wal;
        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            if enable_wal {
                conn.execute_batch("
                    PRAGMA journal_mode = WAL;
                    PRAGMA synchronous = NORMAL;
                    PRAGMA busy_timeout = 5000;
                ")
            } else {
                conn.execute_batch("PRAGMA busy_timeout = 5000;")
            }
        });

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
            .build(manager)?;

        Self::from_pool(pool)
    }

    /// 内存数据库，测试用。单连接池保证所有操作落在同一个库上。
    pub fn in_memory() -> Result<Self> {
        let pool = Pool::builder()
            .max_size(1)
            .build(SqliteConnectionManager::memory())?;
        Self::from_pool(pool)
    }

    fn from_pool(pool: DbPool) -> Result<Self> {
        let db = Self {
            pool,
            insert_count: AtomicU64::new(0),
        };
        db.init_db()?;
        info!(target: DB_TARGET, log_type = "module", "✅ SQLite数据库初始化成功");
        Ok(db)
    }

    /// 建表和索引
    fn init_db(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS candlesticks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                open_time INTEGER NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_candlesticks_symbol ON candlesticks (symbol);
            CREATE INDEX IF NOT EXISTS idx_candlesticks_open_time ON candlesticks (open_time);",
        )
        .map_err(|e| AppError::DatabaseError(format!("Failed to create candlesticks table: {}", e)))?;

        debug!(target: DB_TARGET, decision = "init_db_complete", "数据库表初始化完成");
        Ok(())
    }

    /// 插入一根已完成的K线
    pub fn insert_candlestick(&self, symbol: &str, candlestick: &Candlestick) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO candlesticks (symbol, open_time, open, high, low, close, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                symbol,
                candlestick.open_time,
                candlestick.open,
                candlestick.high,
                candlestick.low,
                candlestick.close,
                chrono::Utc::now().timestamp_millis(),
            ],
        )
        .map_err(|e| AppError::DatabaseError(format!("Failed to insert candlestick: {}", e)))?;

        let total = self.insert_count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(target: DB_TARGET, symbol, open_time = candlestick.open_time, total_inserted = total, "K线已写入");
        Ok(())
    }

    pub fn count_candlesticks(&self, symbol: &str) -> Result<i64> {
        let conn = self.pool.get()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM candlesticks WHERE symbol = ?1",
            params![symbol],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// 最近的K线，按 open_time 从新到旧
    pub fn latest_candlesticks(&self, symbol: &str, limit: usize) -> Result<Vec<Candlestick>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT symbol, open_time, open, high, low, close
             FROM candlesticks WHERE symbol = ?1
             ORDER BY open_time DESC, id DESC LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![symbol, limit as i64], |row| {
            Ok(Candlestick {
                symbol: row.get(0)?,
                open_time: row.get(1)?,
                open: row.get(2)?,
                high: row.get(3)?,
                low: row.get(4)?,
                close: row.get(5)?,
            })
        })?;

        let mut result = Vec::new();
        for candlestick in rows {
            result.push(candlestick?);
        }
        Ok(result)
    }

    /// 本进程内已写入的K线数
    pub fn inserted_count(&self) -> u64 {
        self.insert_count.load(Ordering::Relaxed)
    }
}

impl CandlestickSink for Database {
    fn store(&self, symbol: &str, candlestick: &Candlestick) -> Result<()> {
        self.insert_candlestick(symbol, candlestick)
    }
}
