#[path = "../../../../optmon-bot/tests/integration/common/mock_ws.rs"]
pub mod mock_ws;
