pub fn default_forbidden_paths() -> Vec<String> {
    vec![
        "/etc".into(),
        "/root".into(),
        "/usr".into(),
        "/bin".into(),
        "/sbin".into(),
        "/lib".into(),
        "/boot".into(),
        "/dev".into(),
        "/proc".into(),
        "/sys".into(),
        "/var/lib".into(),
        "/var/log".into(),
        "~/.ssh".into(),
        "~/.gnupg".into(),
        "~/.aws".into(),
        "~/.config".into(),
    ]
}

pub fn default_dangerous_commands() -> Vec<String> {
    vec![
        "sudo".into(),
        "rm -rf".into(),
        "rm -fr".into(),
        "mkfs".into(),
        "dd if=".into(),
        "chmod 777".into(),
        "chown -r".into(),
        ":(){".into(),
        "| sh".into(),
        "| bash".into(),
        "> /dev/".into(),
        "shutdown".into(),
        "reboot".into(),
    ]
}

/// Read-only commands the built-in decision rules approve without escalation.
pub fn default_read_only_commands() -> Vec<String> {
    vec![
        "ls".into(),
        "pwd".into(),
        "cat".into(),
        "head".into(),
        "tail".into(),
        "wc".into(),
        "grep".into(),
        "echo".into(),
        "git status".into(),
        "git diff".into(),
        "git log".into(),
    ]
}
