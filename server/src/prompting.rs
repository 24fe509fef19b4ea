use minijinja::{context, Environment};

const SYSTEM_PROMPT_TEMPLATE: &str = include_str!("prompts/system_prompt.j2");

pub struct SystemPromptContext<'a> {
    pub business_name: &'a str,
    pub reply_language: &'a str,
}

impl SystemPromptContext<'_> {
    fn business_name(&self) -> &str {
        non_blank(self.business_name, "our store")
    }

    fn reply_language(&self) -> &str {
        non_blank(self.reply_language, "English")
    }
}

fn non_blank<'a>(value: &'a str, default: &'a str) -> &'a str {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        default
    } else {
        trimmed
    }
}

pub fn render_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    let mut env = Environment::new();
    if env
        .add_template("system_prompt", SYSTEM_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_system_prompt(ctx);
    }

    let Ok(template) = env.get_template("system_prompt") else {
        return fallback_system_prompt(ctx);
    };

    template
        .render(context! {
            business_name => ctx.business_name(),
            reply_language => ctx.reply_language(),
        })
        .unwrap_or_else(|_| fallback_system_prompt(ctx))
}

fn fallback_system_prompt(ctx: &SystemPromptContext<'_>) -> String {
    format!(
        "You are an AI assistant for {}, a business that sells products online.\n\
         Always respond in {}. Never invent product names, prices, or availability; \
         only use what the catalog functions return and never state stock quantities.\n\
         Call the catalog functions immediately when the customer asks about categories \
         or products. When the message includes a [Post caption: ...], call \
         identify_product_from_post_context with it.\n\
         Only mention prices when asked.\n",
        ctx.business_name(),
        ctx.reply_language()
    )
}
