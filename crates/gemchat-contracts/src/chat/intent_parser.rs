use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, NO_ARG_COMMANDS, RAW_ARG_COMMANDS, SINGLE_PATH_COMMANDS,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub settings_update: BTreeMap<String, Value>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            settings_update: BTreeMap::new(),
            command_args: BTreeMap::new(),
        }
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.command_args
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

fn find_spec(command: &str, specs: &[CommandSpec]) -> Option<CommandSpec> {
    specs.iter().find(|spec| spec.command == command).copied()
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_single_path_arg(arg: &str) -> String {
    let parts = parse_path_args(arg);
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

fn settings_for(spec: &CommandSpec, arg: &str) -> BTreeMap<String, Value> {
    let mut update = BTreeMap::new();
    match spec.action {
        "set_model" if !arg.is_empty() => {
            update.insert("model_name".to_string(), Value::String(arg.to_string()));
        }
        "set_temperature" => {
            if let Some(number) = arg
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
            {
                update.insert("temperature".to_string(), Value::Number(number));
            }
        }
        "set_system_prompt" => {
            update.insert("system_prompt".to_string(), Value::String(arg.to_string()));
        }
        _ => {}
    }
    update
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let remainder = &slash_tail[command_len..];
            let arg = remainder.trim();

            if let Some(spec) = find_spec(&command, RAW_ARG_COMMANDS) {
                let mut intent = Intent::new(spec.action, text);
                intent
                    .command_args
                    .insert(spec.arg_key.to_string(), Value::String(arg.to_string()));
                intent.settings_update = settings_for(&spec, arg);
                return intent;
            }

            if let Some(spec) = find_spec(&command, SINGLE_PATH_COMMANDS) {
                let mut intent = Intent::new(spec.action, text);
                intent.command_args.insert(
                    spec.arg_key.to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if let Some(spec) = find_spec(&command, NO_ARG_COMMANDS) {
                return Intent::new(spec.action, text);
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("send", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn blank_input_is_noop() {
        assert_eq!(parse_intent("   ").action, "noop");
    }

    #[test]
    fn plain_text_is_send() {
        let intent = parse_intent("  tell me a joke  ");
        assert_eq!(intent.action, "send");
        assert_eq!(intent.prompt.as_deref(), Some("tell me a joke"));
    }

    #[test]
    fn attach_commands_accept_quoted_paths() {
        let image = parse_intent("/image \"/tmp/my cat.png\"");
        assert_eq!(image.action, "attach_image");
        assert_eq!(image.command_args["path"], json!("/tmp/my cat.png"));

        let video = parse_intent("/video clip.mp4");
        assert_eq!(video.action, "attach_video");
        assert_eq!(video.arg_str("path"), Some("clip.mp4"));

        let attach = parse_intent("/attach a.webp");
        assert_eq!(attach.action, "attach");
    }

    #[test]
    fn save_without_path_has_empty_arg() {
        let save = parse_intent("/save");
        assert_eq!(save.action, "save");
        assert_eq!(save.arg_str("path"), None);

        let load = parse_intent("/load \"/tmp/old chat.json\"");
        assert_eq!(load.action, "load");
        assert_eq!(load.arg_str("path"), Some("/tmp/old chat.json"));
    }

    #[test]
    fn config_commands_fill_settings_update() {
        let model = parse_intent("/model gemini-2.0-flash-exp");
        assert_eq!(model.action, "set_model");
        assert_eq!(
            model.settings_update["model_name"],
            json!("gemini-2.0-flash-exp")
        );

        let temperature = parse_intent("/temperature 0.4");
        assert_eq!(temperature.action, "set_temperature");
        assert_eq!(temperature.settings_update["temperature"], json!(0.4));

        let unparsable = parse_intent("/temperature warm");
        assert!(unparsable.settings_update.is_empty());
        assert_eq!(unparsable.arg_str("temperature"), Some("warm"));

        let system = parse_intent("/system Answer like a pirate.");
        assert_eq!(system.action, "set_system_prompt");
        assert_eq!(
            system.settings_update["system_prompt"],
            json!("Answer like a pirate.")
        );
    }

    #[test]
    fn no_arg_commands() {
        assert_eq!(parse_intent("/clear").action, "clear");
        assert_eq!(parse_intent("/CONFIG").action, "show_config");
        assert_eq!(parse_intent("/models").action, "list_models");
        assert_eq!(parse_intent("/retry").action, "retry");
        assert_eq!(parse_intent("/exit").action, "quit");
    }

    #[test]
    fn unknown_command() {
        let intent = parse_intent("/magic foo bar");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("magic"));
        assert_eq!(intent.command_args["arg"], json!("foo bar"));
    }
}
