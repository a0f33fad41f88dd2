//! Weather provider backed by canned data.

use serde_json::{json, Value};

use super::registry::{object_schema, optional_i64, required_str, ProviderRegistry, ToolFailure};

pub const NAME: &str = "Weather";

/// (city, conditions, temperature in °F)
const CONDITIONS: &[(&str, &str, i64)] = &[
    ("New York", "Sunny", 75),
    ("London", "Rainy", 60),
    ("Tokyo", "Cloudy", 70),
    ("Paris", "Partly Cloudy", 65),
    ("Sydney", "Clear", 80),
];

const ALERTS: &[(&str, &str)] = &[
    ("London", "Flood watch along the Thames through Thursday"),
    ("Sydney", "High UV index, limit sun exposure between 10am and 3pm"),
];

pub fn registry() -> ProviderRegistry {
    let location = || object_schema(&[("location", "string")], &["location"]);

    ProviderRegistry::new(NAME)
        .tool("get_weather", "Get weather for a location.", location(), get_weather)
        .tool(
            "get_forecast",
            "Get weather forecast for a location for the next N days.",
            object_schema(&[("location", "string"), ("days", "integer")], &["location"]),
            get_forecast,
        )
        .tool(
            "get_alerts",
            "Get active weather alerts for a location.",
            location(),
            get_alerts,
        )
        .tool(
            "get_temperature",
            "Get the current temperature for a location in fahrenheit or celsius.",
            object_schema(&[("location", "string"), ("unit", "string")], &["location"]),
            get_temperature,
        )
}

fn lookup(location: &str) -> Option<&'static (&'static str, &'static str, i64)> {
    CONDITIONS
        .iter()
        .find(|(city, _, _)| city.eq_ignore_ascii_case(location.trim()))
}

fn get_weather(args: &Value) -> Result<Value, ToolFailure> {
    let location = required_str(args, "location")?;
    let text = match lookup(location) {
        Some((_, conditions, temp)) => format!("{conditions}, {temp}°F"),
        None => format!("Weather data not available for {location}"),
    };
    Ok(json!(text))
}

fn get_forecast(args: &Value) -> Result<Value, ToolFailure> {
    let location = required_str(args, "location")?;
    let days = optional_i64(args, "days", 3)?;
    if !(1..=14).contains(&days) {
        return Err(ToolFailure::Failed(format!(
            "days must be between 1 and 14, got {days}"
        )));
    }
    let outlook = match location.trim().to_lowercase().as_str() {
        "new york" | "nyc" => "Sunny followed by partly cloudy conditions",
        "london" => "Rainy with occasional breaks",
        _ => "Mixed conditions expected",
    };
    Ok(json!(format!("{days}-day forecast for {location}: {outlook}")))
}

fn get_alerts(args: &Value) -> Result<Value, ToolFailure> {
    let location = required_str(args, "location")?;
    let text = ALERTS
        .iter()
        .find(|(city, _)| city.eq_ignore_ascii_case(location.trim()))
        .map(|(_, alert)| format!("Alert for {location}: {alert}"))
        .unwrap_or_else(|| format!("No active weather alerts for {location}"));
    Ok(json!(text))
}

fn get_temperature(args: &Value) -> Result<Value, ToolFailure> {
    let location = required_str(args, "location")?;
    let unit = match args.get("unit").and_then(Value::as_str) {
        None => "fahrenheit",
        Some(u) => u,
    };
    let Some((_, _, fahrenheit)) = lookup(location) else {
        return Ok(json!(format!("Temperature not available for {location}")));
    };
    let text = match unit.to_lowercase().as_str() {
        "fahrenheit" | "f" => format!("{fahrenheit}°F"),
        "celsius" | "c" => {
            let celsius = (*fahrenheit as f64 - 32.0) * 5.0 / 9.0;
            format!("{celsius:.1}°C")
        }
        other => {
            return Err(ToolFailure::Failed(format!(
                "unknown unit '{other}', expected fahrenheit or celsius"
            )))
        }
    };
    Ok(json!(text))
}
