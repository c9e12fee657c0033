//! Dialogue log messages in the session's language.

/// User-visible notes written into the dialogue.
#[derive(Debug)]
pub struct Messages {
    pub empty_code: &'static str,
    pub generation_failed: &'static str,
    pub sandbox_failed: &'static str,
    pub tutor_failed: &'static str,
    pub sandbox_lost: &'static str,
}

static EN: Messages = Messages {
    empty_code: "There is no code to run. Add some blocks first.",
    generation_failed: "The blocks could not be turned into a program.",
    sandbox_failed: "The program could not be started.",
    tutor_failed: "The tutor could not answer right now. Please try again.",
    sandbox_lost: "The running program stopped unexpectedly.",
};

static JA: Messages = Messages {
    empty_code: "実行するコードがありません。先にブロックを追加してください。",
    generation_failed: "ブロックをプログラムに変換できませんでした。",
    sandbox_failed: "プログラムを起動できませんでした。",
    tutor_failed: "チューターが応答できませんでした。もう一度お試しください。",
    sandbox_lost: "実行中のプログラムが予期せず停止しました。",
};

static ZH: Messages = Messages {
    empty_code: "没有可运行的代码。请先添加积木。",
    generation_failed: "无法将积木转换为程序。",
    sandbox_failed: "程序无法启动。",
    tutor_failed: "导师暂时无法回答，请稍后再试。",
    sandbox_lost: "正在运行的程序意外停止。",
};

static MS: Messages = Messages {
    empty_code: "Tiada kod untuk dijalankan. Tambah blok terlebih dahulu.",
    generation_failed: "Blok tidak dapat ditukar menjadi program.",
    sandbox_failed: "Program tidak dapat dimulakan.",
    tutor_failed: "Tutor tidak dapat menjawab sekarang. Sila cuba lagi.",
    sandbox_lost: "Program yang sedang berjalan berhenti secara tiba-tiba.",
};

/// Messages for a language tag such as `ja` or `zh-CN`. Unknown tags get English.
pub fn messages(language: &str) -> &'static Messages {
    let primary = language
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match primary.as_str() {
        "ja" => &JA,
        "zh" => &ZH,
        "ms" => &MS,
        _ => &EN,
    }
}
