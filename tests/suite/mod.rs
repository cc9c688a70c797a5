mod chat_session;
mod tool_round_trip;
mod wire;
