// 导出服务器相关模块
pub mod web_server;

// 重新导出一些常用模块，方便使用
pub use self::web_server::{build_router, run_stream_server, serve};
