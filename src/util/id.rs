use uuid::Uuid;

pub fn chat_completion_id() -> String {
    let s = Uuid::new_v4().to_string();
    let prefix = s.split('-').next().unwrap_or(&s);
    let short = &prefix[..prefix.len().min(8)];
    format!("chatcmpl-{short}")
}

pub fn reservation_id() -> String {
    format!("resv-{}", Uuid::new_v4().simple())
}

pub fn upstream_request_id() -> String {
    Uuid::new_v4().to_string()
}
