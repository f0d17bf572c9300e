#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
    /// Key the trimmed argument is stored under in `Intent::command_args`.
    pub arg_key: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "model",
        action: "set_model",
        arg_key: "model",
    },
    CommandSpec {
        command: "temperature",
        action: "set_temperature",
        arg_key: "temperature",
    },
    CommandSpec {
        command: "system",
        action: "set_system_prompt",
        arg_key: "prompt",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "image",
        action: "attach_image",
        arg_key: "path",
    },
    CommandSpec {
        command: "video",
        action: "attach_video",
        arg_key: "path",
    },
    CommandSpec {
        command: "attach",
        action: "attach",
        arg_key: "path",
    },
    CommandSpec {
        command: "save",
        action: "save",
        arg_key: "path",
    },
    CommandSpec {
        command: "load",
        action: "load",
        arg_key: "path",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "clear",
        action: "clear",
        arg_key: "",
    },
    CommandSpec {
        command: "detach",
        action: "detach",
        arg_key: "",
    },
    CommandSpec {
        command: "history",
        action: "history",
        arg_key: "",
    },
    CommandSpec {
        command: "config",
        action: "show_config",
        arg_key: "",
    },
    CommandSpec {
        command: "models",
        action: "list_models",
        arg_key: "",
    },
    CommandSpec {
        command: "retry",
        action: "retry",
        arg_key: "",
    },
    CommandSpec {
        command: "help",
        action: "help",
        arg_key: "",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
        arg_key: "",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
        arg_key: "",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/model",
    "/temperature",
    "/system",
    "/image",
    "/video",
    "/attach",
    "/detach",
    "/save",
    "/load",
    "/clear",
    "/history",
    "/config",
    "/models",
    "/retry",
    "/help",
    "/quit",
];
