use chrono::{TimeZone, Utc};
use chrono_tz::Tz;

/// 读取 NOFX_TIMEZONE 指定的展示时区（IANA名称），默认东八区。
/// 仅用于用户提示词中的时间格式化，内部时间戳一律为UTC毫秒。
pub fn display_timezone() -> Tz {
    std::env::var("NOFX_TIMEZONE")
        .ok()
        .and_then(|name| name.parse::<Tz>().ok())
        .unwrap_or(chrono_tz::Asia::Shanghai)
}

/// 当前时间按展示时区格式化为 "%Y-%m-%d %H:%M:%S"
pub fn now_display_string() -> String {
    Utc::now()
        .with_timezone(&display_timezone())
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// 毫秒时间戳转UTC时间字符串
pub fn mill_time_to_datetime(timestamp_ms: i64) -> Result<String, String> {
    match Utc.timestamp_millis_opt(timestamp_ms) {
        chrono::LocalResult::Single(datetime) => {
            Ok(datetime.format("%Y-%m-%d %H:%M:%S").to_string())
        }
        _ => Err(format!("Invalid timestamp: {}", timestamp_ms)),
    }
}

/// 持仓时长格式化：分钟 -> "x分钟" / "x小时y分钟" / "x天y小时"
pub fn format_holding_duration(duration_min: i64) -> String {
    if duration_min < 60 {
        format!("{}分钟", duration_min)
    } else if duration_min < 1440 {
        format!("{}小时{}分钟", duration_min / 60, duration_min % 60)
    } else {
        format!("{}天{}小时", duration_min / 1440, (duration_min % 1440) / 60)
    }
}
