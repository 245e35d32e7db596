pub const TOPIC_ROOT: &str = "recirculator";

pub fn status_request_topic(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/get")
}

pub fn status_reply_topic(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/status")
}

pub fn command_topic(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/cmnd")
}

pub fn command_reply_topic(device_id: &str) -> String {
    format!("{TOPIC_ROOT}/{device_id}/reply")
}
