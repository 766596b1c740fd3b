mod helpers;
mod tests_find;
