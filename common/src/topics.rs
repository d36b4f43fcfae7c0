pub const TOPIC_CMD_SWITCH: &str = "relayswitch/cmnd/switch";
pub const TOPIC_SWITCH_STATE: &str = "relayswitch/stat/switch";

pub const TOPIC_AVAILABILITY: &str = "relayswitch/tele/availability";
pub const TOPIC_HEARTBEAT: &str = "relayswitch/tele/heartbeat";

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";
