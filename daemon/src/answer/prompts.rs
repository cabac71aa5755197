//! System prompt for the assistant persona

use chrono::{Datelike, Local, NaiveDateTime, Timelike};

use crate::language::Language;

const SPANISH_WEEKDAYS: [&str; 7] = [
    "lunes", "martes", "miércoles", "jueves", "viernes", "sábado", "domingo",
];

const SPANISH_MONTHS: [&str; 12] = [
    "enero", "febrero", "marzo", "abril", "mayo", "junio", "julio", "agosto",
    "septiembre", "octubre", "noviembre", "diciembre",
];

/// System prompt for the current local time
pub fn system_prompt(language: Language) -> String {
    system_prompt_at(language, Local::now().naive_local())
}

/// System prompt for a given time
pub fn system_prompt_at(language: Language, now: NaiveDateTime) -> String {
    match language {
        Language::Spanish => format!(
            "Eres Nova, un asistente de IA integrado en unos lentes inteligentes Meta Ray-Ban.\n\
             Fecha y hora actual: {}.\n\
             Responde de forma concisa y útil en español, máximo 2-3 oraciones.\n\
             Si recibes una imagen, descríbela en contexto de lo que el usuario pregunta.",
            spanish_timestamp(now)
        ),
        Language::English => format!(
            "You are Nova, an AI assistant integrated into Meta Ray-Ban smart glasses.\n\
             Current date and time: {}.\n\
             Respond concisely and helpfully in English, maximum 2-3 sentences.\n\
             If you receive an image, describe it in the context of what the user asks.",
            now.format("%A, %B %-d %Y, %H:%M")
        ),
    }
}

fn spanish_timestamp(now: NaiveDateTime) -> String {
    format!(
        "{} {} de {} {}, {:02}:{:02}",
        SPANISH_WEEKDAYS[now.weekday().num_days_from_monday() as usize],
        now.day(),
        SPANISH_MONTHS[now.month0() as usize],
        now.year(),
        now.hour(),
        now.minute()
    )
}
